//! Projection worker task.
//!
//! Hosts one `CoreProjection` on its own task: pumps commands, log
//! completions, ticks, and subscription records through the single-threaded
//! dispatch, and applies the effects each dispatch produces (subscribing,
//! pausing the reader, publishing management messages).

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::config::ProjectionConfig;
use crate::filter::EventFilter;
use crate::handler::ProjectionHandler;
use crate::messages::{ManagementMessage, ProjectionCommand, ProjectionEvent};
use crate::stats::ProjectionStatistics;
use crate::store::{spawn_dispatcher, EventLog, ProjectionIo, SourceRecord};
use crate::subscription::ProjectionSubscription;
use crate::tag::PositionTagger;

use super::{CoreMessage, CoreProjection, ProjectionEffect};

/// Handle to a spawned projection.
pub struct ProjectionHandle {
    commands: mpsc::UnboundedSender<ProjectionCommand>,
    join: JoinHandle<()>,
}

impl ProjectionHandle {
    /// Load state and run.
    pub fn start(&self) {
        let _ = self.commands.send(ProjectionCommand::Start);
    }

    /// Load state but stay stopped.
    pub fn load_stopped(&self) {
        let _ = self.commands.send(ProjectionCommand::LoadStopped);
    }

    /// Stop, optionally persisting a final checkpoint.
    pub fn stop(&self, write_checkpoint: bool) {
        let _ = self
            .commands
            .send(ProjectionCommand::Stop { write_checkpoint });
    }

    /// A partition's current state, if any.
    pub async fn get_state(&self, partition: impl Into<String>) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(ProjectionCommand::GetState {
            partition: partition.into(),
            reply,
        });
        rx.await.ok().flatten()
    }

    /// The recent event trail.
    pub async fn debug_state(&self) -> Vec<ProjectionEvent> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .commands
            .send(ProjectionCommand::GetDebugState { reply });
        rx.await.unwrap_or_default()
    }

    /// A point-in-time statistics report.
    pub async fn statistics(&self) -> ProjectionStatistics {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .commands
            .send(ProjectionCommand::GetStatistics { reply });
        rx.await.unwrap_or_default()
    }

    /// Wait for the worker to exit (after dropping all other handles or
    /// explicit shutdown).
    pub async fn join(self) {
        let ProjectionHandle { commands, join } = self;
        drop(commands);
        let _ = join.await;
    }
}

/// Spawn a projection on its own worker task.
pub fn spawn_projection(
    name: impl Into<String>,
    config: ProjectionConfig,
    tagger: PositionTagger,
    filter: EventFilter,
    handler: Box<dyn ProjectionHandler>,
    log: Arc<dyn EventLog>,
    management: mpsc::UnboundedSender<ManagementMessage>,
) -> ProjectionHandle {
    let name = name.into();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    spawn_dispatcher(log.clone(), request_rx, reply_tx);

    let io = ProjectionIo::new(request_tx);
    let core = CoreProjection::new(name, config.clone(), tagger.clone(), handler, io);

    let worker = Worker {
        core,
        config,
        tagger,
        filter,
        log,
        management,
        subscription: None,
        source: None,
        paused: false,
    };
    let join = tokio::spawn(worker.run(command_rx, reply_rx));

    ProjectionHandle {
        commands: command_tx,
        join,
    }
}

struct Worker {
    core: CoreProjection,
    config: ProjectionConfig,
    tagger: PositionTagger,
    filter: EventFilter,
    log: Arc<dyn EventLog>,
    management: mpsc::UnboundedSender<ManagementMessage>,
    subscription: Option<ProjectionSubscription>,
    source: Option<ReceiverStream<SourceRecord>>,
    paused: bool,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ProjectionCommand>,
        mut replies: mpsc::UnboundedReceiver<crate::store::IoCompleted>,
    ) {
        let (tick_tx, mut ticks) = mpsc::unbounded_channel::<()>();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.dispatch(CoreMessage::Command(command), &tick_tx).await,
                    // All handles dropped: shut the worker down.
                    None => break,
                },
                Some(completed) = replies.recv() => {
                    self.dispatch(CoreMessage::Io(completed), &tick_tx).await;
                }
                Some(()) = ticks.recv() => {
                    self.dispatch(CoreMessage::Tick, &tick_tx).await;
                }
                record = next_record(&mut self.source), if self.source.is_some() && !self.paused => {
                    match record {
                        Some(record) => self.pump_subscription(record, &tick_tx).await,
                        // The source closed; a bounded source signals EOF
                        // explicitly before this.
                        None => self.source = None,
                    }
                }
            }
        }

        self.core.dispose();
        debug!("Projection worker exited");
    }

    async fn pump_subscription(
        &mut self,
        record: SourceRecord,
        tick_tx: &mpsc::UnboundedSender<()>,
    ) {
        let Some(subscription) = self.subscription.as_mut() else {
            return;
        };
        match subscription.process(record) {
            Ok(messages) => {
                for message in messages {
                    self.dispatch(CoreMessage::Subscription(message), tick_tx).await;
                }
            }
            Err(error) => {
                self.dispatch(
                    CoreMessage::SubscriptionError(format!("Subscription failed: {error}")),
                    tick_tx,
                )
                .await;
            }
        }
    }

    async fn dispatch(&mut self, message: CoreMessage, tick_tx: &mpsc::UnboundedSender<()>) {
        self.core.handle(message);
        let effects = self.core.drain_effects();
        for effect in effects {
            match effect {
                ProjectionEffect::Subscribe {
                    subscription_id,
                    from,
                } => {
                    let subscription = ProjectionSubscription::new(
                        subscription_id,
                        self.tagger.clone(),
                        self.filter.clone(),
                        from.clone(),
                        &self.config,
                    );
                    let source = self
                        .log
                        .subscribe_from(from.subscribe_position(), self.filter.clone())
                        .await;
                    self.subscription = Some(subscription);
                    self.source = Some(source);
                    self.paused = false;
                }
                ProjectionEffect::Unsubscribe => {
                    self.subscription = None;
                    self.source = None;
                    self.paused = false;
                }
                ProjectionEffect::PauseSubscription => self.paused = true,
                ProjectionEffect::ResumeSubscription => self.paused = false,
                ProjectionEffect::ScheduleTick => {
                    let _ = tick_tx.send(());
                }
                ProjectionEffect::Publish(message) => {
                    let _ = self.management.send(message);
                }
            }
        }
    }
}

async fn next_record(source: &mut Option<ReceiverStream<SourceRecord>>) -> Option<SourceRecord> {
    match source.as_mut() {
        Some(source) => source.next().await,
        None => None,
    }
}
