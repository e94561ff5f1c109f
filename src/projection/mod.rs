//! Core projection lifecycle state machine.
//!
//! A `CoreProjection` owns one staged queue, one partition state cache, and
//! one checkpoint manager (which owns the emitted streams). Everything runs
//! on a single worker; suspension points are the outbound log requests,
//! which come back as inbound messages. The runner task pumps the inbox and
//! applies the effects each dispatch produces.
//!
//! State machine:
//!
//! ```text
//! Initial -> LoadStateRequested -> StateLoadedSubscribed -> Running
//!                                                       \-> Stopped (load_stopped)
//! Running -> Stopping -> Stopped
//! any     -> FaultedStopping -> Faulted
//! restart_requested: teardown -> Initial -> LoadStateRequested -> ...
//! ```

mod runner;

pub use runner::{spawn_projection, ProjectionHandle};

use std::collections::{HashMap, VecDeque};
use std::fmt;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{PartitionState, PartitionStateCache, TryLock, ROOT_PARTITION};
use crate::checkpoint::{CheckpointLoaded, CheckpointManager, WriteStrategy};
use crate::config::ProjectionConfig;
use crate::emitted::{EmitFault, EmittedEvent};
use crate::filter::category_of;
use crate::handler::{EventEnvelope, ProjectionHandler};
use crate::messages::{
    ManagementMessage, ProjectionCommand, ProjectionEvent, SequencedMessage, SubscriptionMessage,
};
use crate::naming::StreamNames;
use crate::queue::{
    ProcessEventItem, StagedQueue, WorkItem, STAGE_LOAD_STATE, STAGE_PROCESS_EVENT,
    STAGE_RESOLVE_PARTITION, STAGE_WRITE_OUTPUT,
};
use crate::stats::ProjectionStatistics;
use crate::store::{
    BackwardReadCompleted, IoCompleted, IoCompletion, IoRoute, ProjectionIo, ReadResult, FROM_END,
};
use crate::tag::{CheckpointTag, PositionTagger, TagError};

/// Recent events kept for debug reporting.
const DEBUG_HISTORY: usize = 16;

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionState {
    Initial,
    LoadStateRequested,
    StateLoadedSubscribed,
    Running,
    Stopping,
    Stopped,
    FaultedStopping,
    Faulted,
}

impl fmt::Display for ProjectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProjectionState::Initial => "Initial",
            ProjectionState::LoadStateRequested => "LoadStateRequested",
            ProjectionState::StateLoadedSubscribed => "StateLoadedSubscribed",
            ProjectionState::Running => "Running",
            ProjectionState::Stopping => "Stopping",
            ProjectionState::Stopped => "Stopped",
            ProjectionState::FaultedStopping => "FaultedStopping",
            ProjectionState::Faulted => "Faulted",
        };
        write!(f, "{name}")
    }
}

/// Messages dispatched on the projection worker.
#[derive(Debug)]
pub enum CoreMessage {
    Command(ProjectionCommand),
    Subscription(SequencedMessage),
    Io(IoCompleted),
    /// The subscription failed to tag or order a record.
    SubscriptionError(String),
    Tick,
}

/// Instructions for the runner, produced by dispatch.
#[derive(Debug)]
pub enum ProjectionEffect {
    Subscribe {
        subscription_id: Uuid,
        from: CheckpointTag,
    },
    Unsubscribe,
    PauseSubscription,
    ResumeSubscription,
    ScheduleTick,
    Publish(ManagementMessage),
}

/// Why a dispatch could not complete.
#[derive(Debug)]
enum CoreFault {
    /// Tear down and re-enter startup.
    Restart(String),
    /// Transition to Faulted.
    Fatal(String),
}

impl From<EmitFault> for CoreFault {
    fn from(fault: EmitFault) -> Self {
        match fault {
            EmitFault::Restart(reason) => CoreFault::Restart(reason),
            EmitFault::Fatal(reason) => CoreFault::Fatal(reason),
        }
    }
}

impl From<TagError> for CoreFault {
    fn from(error: TagError) -> Self {
        CoreFault::Fatal(error.to_string())
    }
}

type DispatchResult = Result<(), CoreFault>;

enum StageOutcome {
    Done,
    Suspended,
}

struct PendingStateRequest {
    partition: String,
    reply: oneshot::Sender<Option<String>>,
}

/// The projection core.
pub struct CoreProjection {
    name: String,
    config: ProjectionConfig,
    names: StreamNames,
    tagger: PositionTagger,
    handler: Box<dyn ProjectionHandler>,
    io: ProjectionIo,
    state: ProjectionState,
    start_on_load: bool,
    /// Write a checkpoint while entering Stopped.
    stop_write_checkpoint: bool,
    stop_checkpoint_requested: bool,
    subscription_id: Option<Uuid>,
    expected_sequence: u64,
    /// Last fully processed tag; advances at the write stage.
    position: CheckpointTag,
    progress: f32,
    queue: StagedQueue,
    cache: PartitionStateCache,
    manager: CheckpointManager,
    partition_state_persisted: bool,
    /// Partition currently loaded into the handler.
    loaded_partition: Option<String>,
    tick_pending: bool,
    subscription_paused: bool,
    events_processed_after_restart: u64,
    debug_history: VecDeque<ProjectionEvent>,
    faulted_reason: Option<String>,
    state_requests: HashMap<u64, PendingStateRequest>,
    next_state_request: u64,
    effects: Vec<ProjectionEffect>,
    disposed: bool,
}

impl CoreProjection {
    pub fn new(
        name: impl Into<String>,
        config: ProjectionConfig,
        tagger: PositionTagger,
        handler: Box<dyn ProjectionHandler>,
        io: ProjectionIo,
    ) -> Self {
        let name = name.into();
        let names = StreamNames::new(name.as_str());
        let partition_state_persisted = handler.is_partitioned() && config.emit_partition_state;
        let strategy = if partition_state_persisted {
            WriteStrategy::Partitioned
        } else {
            WriteStrategy::Default
        };
        let manager = CheckpointManager::new(
            names.clone(),
            io.clone(),
            strategy,
            config.checkpoints_enabled,
            config.max_write_batch_length,
        );
        let position = tagger.zero_tag();
        Self {
            names,
            tagger,
            handler,
            io,
            state: ProjectionState::Initial,
            start_on_load: false,
            stop_write_checkpoint: true,
            stop_checkpoint_requested: false,
            subscription_id: None,
            expected_sequence: 0,
            position,
            progress: 0.0,
            queue: StagedQueue::new(),
            cache: PartitionStateCache::new(config.max_cached_partitions),
            manager,
            partition_state_persisted,
            loaded_partition: None,
            tick_pending: false,
            subscription_paused: false,
            events_processed_after_restart: 0,
            debug_history: VecDeque::new(),
            faulted_reason: None,
            state_requests: HashMap::new(),
            next_state_request: 0,
            effects: Vec::new(),
            disposed: false,
            config,
            name,
        }
    }

    pub fn state(&self) -> ProjectionState {
        self.state
    }

    /// Take the effects produced by the last dispatch.
    pub fn drain_effects(&mut self) -> Vec<ProjectionEffect> {
        std::mem::take(&mut self.effects)
    }

    /// Dispatch one message. Faults are absorbed into the state machine.
    pub fn handle(&mut self, message: CoreMessage) {
        let result = match message {
            CoreMessage::Command(command) => self.handle_command(command),
            CoreMessage::Subscription(message) => self.handle_subscription(message),
            CoreMessage::Io(completed) => self.handle_io(completed),
            CoreMessage::SubscriptionError(reason) => Err(CoreFault::Fatal(reason)),
            CoreMessage::Tick => self.handle_tick(),
        };
        if let Err(fault) = result {
            self.apply_fault(fault);
        }
        self.after_dispatch();
    }

    /// Release the handler and children. Called once when the runner exits.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.io.cancel_all();
        self.manager.dispose();
        self.handler.dispose();
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: ProjectionCommand) -> DispatchResult {
        match command {
            ProjectionCommand::Start => {
                self.start_on_load = true;
                self.begin_start()
            }
            ProjectionCommand::LoadStopped => {
                self.start_on_load = false;
                self.begin_start()
            }
            ProjectionCommand::Stop { write_checkpoint } => self.begin_stop(write_checkpoint),
            ProjectionCommand::GetState { partition, reply } => {
                self.handle_get_state(partition, reply)
            }
            ProjectionCommand::GetDebugState { reply } => {
                let events: Vec<ProjectionEvent> = self.debug_history.iter().cloned().collect();
                self.publish(ManagementMessage::DebugState {
                    name: self.name.clone(),
                    events: events.clone(),
                });
                let _ = reply.send(events);
                Ok(())
            }
            ProjectionCommand::GetStatistics { reply } => {
                let statistics = self.statistics();
                self.publish(ManagementMessage::StatisticsReport {
                    name: self.name.clone(),
                    statistics: Box::new(statistics.clone()),
                });
                let _ = reply.send(statistics);
                Ok(())
            }
        }
    }

    fn begin_start(&mut self) -> DispatchResult {
        match self.state {
            ProjectionState::Initial => {}
            ProjectionState::Stopped | ProjectionState::Faulted => {
                self.teardown();
                self.faulted_reason = None;
            }
            _ => {
                return Err(CoreFault::Fatal(format!(
                    "Invalid operation in state {}: Stream is already started",
                    self.state
                )));
            }
        }
        info!(projection = %self.name, "Projection starting");
        self.state = ProjectionState::LoadStateRequested;
        self.manager.begin_load();
        Ok(())
    }

    fn begin_stop(&mut self, write_checkpoint: bool) -> DispatchResult {
        match self.state {
            ProjectionState::Running => {}
            ProjectionState::Stopping | ProjectionState::Stopped => return Ok(()),
            other => {
                return Err(CoreFault::Fatal(format!(
                    "Invalid operation: stop in state {other}"
                )));
            }
        }
        info!(projection = %self.name, write_checkpoint, "Projection stopping");
        self.state = ProjectionState::Stopping;
        self.stop_write_checkpoint = write_checkpoint;
        self.stop_checkpoint_requested = false;
        self.subscription_id = None;
        self.effects.push(ProjectionEffect::Unsubscribe);
        Ok(())
    }

    fn handle_get_state(
        &mut self,
        partition: String,
        reply: oneshot::Sender<Option<String>>,
    ) -> DispatchResult {
        if let Some(state) = self.cache.peek(&partition) {
            let data = state.data.clone();
            self.publish(ManagementMessage::StateReport {
                name: self.name.clone(),
                partition,
                state: Some(data.clone()),
            });
            let _ = reply.send(Some(data));
            return Ok(());
        }
        if self.partition_state_persisted && partition != ROOT_PARTITION {
            // Out-of-band read; never touches the cache or its locks.
            let request = self.next_state_request;
            self.next_state_request += 1;
            self.io.read_backward(
                IoRoute::StateRequest { request },
                &self.names.partition_state_stream(&partition),
                FROM_END,
                1,
            );
            self.state_requests
                .insert(request, PendingStateRequest { partition, reply });
            return Ok(());
        }
        self.publish(ManagementMessage::StateReport {
            name: self.name.clone(),
            partition,
            state: None,
        });
        let _ = reply.send(None);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subscription input
    // ------------------------------------------------------------------

    fn handle_subscription(&mut self, message: SequencedMessage) -> DispatchResult {
        let Some(live) = self.subscription_id else {
            debug!(projection = %self.name, "Dropping message from closed subscription");
            return Ok(());
        };
        if message.subscription_id != live {
            debug!(
                projection = %self.name,
                stale = %message.subscription_id,
                "Dropping message from stale subscription"
            );
            return Ok(());
        }
        if self.state != ProjectionState::Running {
            return Err(CoreFault::Fatal(format!(
                "Subscription message delivered in state {}",
                self.state
            )));
        }
        if message.sequence != self.expected_sequence + 1 {
            return Err(CoreFault::Fatal(format!(
                "Subscription message out of order: expected {}, got {}",
                self.expected_sequence + 1,
                message.sequence
            )));
        }
        self.expected_sequence = message.sequence;

        match message.payload {
            SubscriptionMessage::EventReceived(event) => {
                self.debug_history.push_back(event.clone());
                if self.debug_history.len() > DEBUG_HISTORY {
                    self.debug_history.pop_front();
                }
                self.queue
                    .enqueue(WorkItem::ProcessEvent(Box::new(ProcessEventItem {
                        event,
                        partition: None,
                        outcome: None,
                    })))?;
                self.schedule_tick();
                self.update_backpressure();
            }
            SubscriptionMessage::CheckpointSuggested { tag } => {
                self.queue.enqueue(WorkItem::EmitCheckpoint { tag })?;
                self.schedule_tick();
            }
            SubscriptionMessage::ProgressChanged { progress } => {
                self.queue.enqueue(WorkItem::ProgressUpdate { progress })?;
                self.schedule_tick();
            }
            SubscriptionMessage::EofReached => {
                info!(projection = %self.name, "Source EOF reached");
                self.begin_stop(true)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // IO completions
    // ------------------------------------------------------------------

    fn handle_io(&mut self, completed: IoCompleted) -> DispatchResult {
        if !self.io.take(completed.correlation_id) {
            debug!(
                projection = %self.name,
                correlation_id = %completed.correlation_id,
                "Dropping cancelled completion"
            );
            return Ok(());
        }
        let IoCompleted {
            route, completion, ..
        } = completed;
        match (route, completion) {
            (IoRoute::CheckpointLoad, IoCompletion::ReadBackward(read)) => {
                if let Some(loaded) = self.manager.handle_load_read(read)? {
                    self.state_loaded(loaded)?;
                }
                Ok(())
            }
            (IoRoute::CheckpointWrite, IoCompletion::Write(write)) => {
                if let Some(tag) = self.manager.handle_write_completed(write)? {
                    self.checkpoint_completed(&tag)?;
                }
                Ok(())
            }
            (IoRoute::CheckpointRetry, IoCompletion::TimerFired) => {
                self.manager.handle_retry_timer()?;
                Ok(())
            }
            (
                route @ (IoRoute::EmittedRecovery { .. }
                | IoRoute::EmittedWrite { .. }
                | IoRoute::EmittedRetry { .. }),
                completion,
            ) => {
                self.manager.handle_emitted_io(&route, completion)?;
                // Drained emits may unpark the checkpoint.
                self.manager.poll()?;
                Ok(())
            }
            (IoRoute::PartitionLoad { item }, IoCompletion::ReadBackward(read)) => {
                self.handle_partition_load(item, read)
            }
            (IoRoute::StateRequest { request }, IoCompletion::ReadBackward(read)) => {
                self.handle_state_request_read(request, read);
                Ok(())
            }
            (route, completion) => Err(CoreFault::Fatal(format!(
                "Mismatched completion {completion:?} for route {route:?}"
            ))),
        }
    }

    fn state_loaded(&mut self, loaded: CheckpointLoaded) -> DispatchResult {
        if self.state != ProjectionState::LoadStateRequested {
            return Err(CoreFault::Fatal(format!(
                "Checkpoint loaded in state {}",
                self.state
            )));
        }
        let tag = match loaded.tag {
            Some(tag) => {
                if !self.tagger.is_compatible(&tag) {
                    return Err(CoreFault::Fatal(format!(
                        "Persisted checkpoint tag {tag} does not match this projection's source"
                    )));
                }
                tag
            }
            None => self.tagger.zero_tag(),
        };

        self.handler
            .initialize()
            .map_err(|error| CoreFault::Fatal(format!("Handler initialize failed: {error}")))?;
        self.handler
            .load(&loaded.state)
            .map_err(|error| CoreFault::Fatal(format!("Handler load failed: {error}")))?;
        self.loaded_partition = Some(ROOT_PARTITION.to_string());
        self.cache.cache_and_lock(
            ROOT_PARTITION,
            PartitionState::new(loaded.state, tag.clone()),
            None,
        );
        self.position = tag.clone();

        let subscription_id = Uuid::new_v4();
        self.subscription_id = Some(subscription_id);
        self.expected_sequence = 0;
        self.state = ProjectionState::StateLoadedSubscribed;
        self.effects.push(ProjectionEffect::Subscribe {
            subscription_id,
            from: tag.clone(),
        });
        info!(projection = %self.name, tag = %tag, "State loaded, subscribed");

        if self.start_on_load {
            self.state = ProjectionState::Running;
            self.publish(ManagementMessage::Started {
                name: self.name.clone(),
            });
        } else {
            self.subscription_id = None;
            self.effects.push(ProjectionEffect::Unsubscribe);
            self.enter_stopped();
        }
        Ok(())
    }

    fn checkpoint_completed(&mut self, tag: &CheckpointTag) -> DispatchResult {
        self.cache.unlock(tag)?;
        debug!(projection = %self.name, tag = %tag, "Checkpoint completed, partitions unlocked");
        Ok(())
    }

    fn handle_partition_load(
        &mut self,
        item: u64,
        read: BackwardReadCompleted,
    ) -> DispatchResult {
        if !self.queue.resume(item) {
            debug!(projection = %self.name, item, "Dropping state read for retired work item");
            return Ok(());
        }
        let Some(WorkItem::ProcessEvent(process)) = self.queue.item_mut(item) else {
            return Err(CoreFault::Fatal(
                "Partition state read for a non-event work item".to_string(),
            ));
        };
        let Some(partition) = process.partition.clone() else {
            return Err(CoreFault::Fatal(
                "Partition state read before partition was resolved".to_string(),
            ));
        };
        let at_tag = process.event.tag.clone();

        match read.result {
            ReadResult::NoStream => {
                self.cache.cache_and_lock(
                    &partition,
                    PartitionState::new("", at_tag.clone()),
                    None,
                );
                self.manager.partition_created(&partition, &at_tag)?;
            }
            ReadResult::Success => match read.events.first() {
                Some(event) => {
                    let caused_by = CheckpointTag::from_metadata(&event.metadata)?;
                    self.cache.cache_and_lock(
                        &partition,
                        PartitionState::new(event.data.clone(), caused_by),
                        None,
                    );
                }
                None => {
                    self.cache.cache_and_lock(
                        &partition,
                        PartitionState::new("", at_tag.clone()),
                        None,
                    );
                    self.manager.partition_created(&partition, &at_tag)?;
                }
            },
            other => {
                return Err(CoreFault::Fatal(format!(
                    "Unsupported read result {other:?} loading partition {partition}"
                )));
            }
        }
        self.schedule_tick();
        Ok(())
    }

    fn handle_state_request_read(&mut self, request: u64, read: BackwardReadCompleted) {
        let Some(pending) = self.state_requests.remove(&request) else {
            return;
        };
        let state = match read.result {
            ReadResult::Success => read.events.first().map(|event| event.data.clone()),
            _ => None,
        };
        self.publish(ManagementMessage::StateReport {
            name: self.name.clone(),
            partition: pending.partition,
            state: state.clone(),
        });
        let _ = pending.reply.send(state);
    }

    // ------------------------------------------------------------------
    // Queue draining
    // ------------------------------------------------------------------

    fn handle_tick(&mut self) -> DispatchResult {
        self.tick_pending = false;
        self.drain_queue()
    }

    fn schedule_tick(&mut self) {
        if !self.tick_pending {
            self.tick_pending = true;
            self.effects.push(ProjectionEffect::ScheduleTick);
        }
    }

    fn drain_queue(&mut self) -> DispatchResult {
        while let Some((id, stage)) = self.queue.next_runnable() {
            match self.run_stage(id, stage)? {
                StageOutcome::Done => {
                    self.queue.complete_stage(id);
                }
                StageOutcome::Suspended => self.queue.suspend(id),
            }
        }
        self.update_backpressure();
        self.manager.poll()?;
        Ok(())
    }

    fn run_stage(&mut self, id: u64, stage: u8) -> Result<StageOutcome, CoreFault> {
        match stage {
            STAGE_RESOLVE_PARTITION => self.stage_resolve_partition(id),
            STAGE_LOAD_STATE => self.stage_load_state(id),
            STAGE_PROCESS_EVENT => self.stage_process_event(id),
            STAGE_WRITE_OUTPUT => self.stage_write_output(id),
            other => Err(CoreFault::Fatal(format!("Unknown stage {other}"))),
        }
    }

    fn stage_resolve_partition(&mut self, id: u64) -> Result<StageOutcome, CoreFault> {
        let Some(WorkItem::ProcessEvent(process)) = self.queue.item_mut(id) else {
            return Ok(StageOutcome::Done);
        };
        let envelope = envelope_for(&process.event, String::new());
        let partition = self.handler.partition_of(&envelope);
        process.partition = Some(partition);
        Ok(StageOutcome::Done)
    }

    fn stage_load_state(&mut self, id: u64) -> Result<StageOutcome, CoreFault> {
        let Some(WorkItem::ProcessEvent(process)) = self.queue.item_mut(id) else {
            return Ok(StageOutcome::Done);
        };
        let Some(partition) = process.partition.clone() else {
            return Err(CoreFault::Fatal(
                "Load-state stage reached before partition was resolved".to_string(),
            ));
        };
        if partition == ROOT_PARTITION {
            return Ok(StageOutcome::Done);
        }
        let at_tag = process.event.tag.clone();
        match self.cache.try_lock_at(&partition, &at_tag, false)? {
            TryLock::Locked(_) => Ok(StageOutcome::Done),
            TryLock::Conflict { held_at } => Err(CoreFault::Fatal(format!(
                "Partition {partition} is locked at {held_at}, cannot lock at {at_tag}"
            ))),
            TryLock::NotCached => {
                if self.partition_state_persisted {
                    self.io.read_backward(
                        IoRoute::PartitionLoad { item: id },
                        &self.names.partition_state_stream(&partition),
                        FROM_END,
                        1,
                    );
                    Ok(StageOutcome::Suspended)
                } else {
                    self.cache.cache_and_lock(
                        &partition,
                        PartitionState::new("", at_tag.clone()),
                        Some(at_tag.clone()),
                    );
                    self.manager.partition_created(&partition, &at_tag)?;
                    Ok(StageOutcome::Done)
                }
            }
        }
    }

    fn stage_process_event(&mut self, id: u64) -> Result<StageOutcome, CoreFault> {
        let (event, partition) = match self.queue.item_mut(id) {
            Some(WorkItem::ProcessEvent(process)) => {
                let Some(partition) = process.partition.clone() else {
                    return Err(CoreFault::Fatal(
                        "Process stage reached before partition was resolved".to_string(),
                    ));
                };
                (process.event.clone(), partition)
            }
            _ => return Ok(StageOutcome::Done),
        };

        let Some(state) = self.cache.get_locked(&partition) else {
            return Err(CoreFault::Fatal(format!(
                "Partition {partition} is not held at process time"
            )));
        };
        let state_data = state.data.clone();

        if self.loaded_partition.as_deref() != Some(partition.as_str()) {
            self.handler.load(&state_data).map_err(|error| {
                CoreFault::Fatal(format!(
                    "Handler load failed for partition {partition}: {error}"
                ))
            })?;
            self.loaded_partition = Some(partition.clone());
        }

        let envelope = envelope_for(&event, partition.clone());
        let outcome = self.handler.process_event(&envelope).map_err(|error| {
            CoreFault::Fatal(format!("Handler failed at {}: {error}", event.tag))
        })?;

        if outcome.handled {
            self.cache.cache_and_lock(
                &partition,
                PartitionState::new(outcome.new_state.clone(), event.tag.clone()),
                Some(event.tag.clone()),
            );
        }
        if let Some(WorkItem::ProcessEvent(process)) = self.queue.item_mut(id) {
            process.outcome = Some(outcome);
        }
        Ok(StageOutcome::Done)
    }

    fn stage_write_output(&mut self, id: u64) -> Result<StageOutcome, CoreFault> {
        enum Output {
            Event {
                tag: CheckpointTag,
                partition: String,
                outcome: crate::handler::ProcessingOutcome,
            },
            Checkpoint(CheckpointTag),
            Progress(f32),
        }
        let output = match self.queue.item_mut(id) {
            Some(WorkItem::ProcessEvent(process)) => {
                let Some(outcome) = process.outcome.take() else {
                    return Err(CoreFault::Fatal(
                        "Write stage reached with no processing outcome".to_string(),
                    ));
                };
                let Some(partition) = process.partition.clone() else {
                    return Err(CoreFault::Fatal(
                        "Write stage reached before partition was resolved".to_string(),
                    ));
                };
                Output::Event {
                    tag: process.event.tag.clone(),
                    partition,
                    outcome,
                }
            }
            Some(WorkItem::EmitCheckpoint { tag }) => Output::Checkpoint(tag.clone()),
            Some(WorkItem::ProgressUpdate { progress }) => Output::Progress(*progress),
            None => return Ok(StageOutcome::Done),
        };

        match output {
            Output::Event {
                tag,
                partition,
                outcome,
            } => {
                if !tag.is_after(&self.position)? {
                    return Err(CoreFault::Fatal(format!(
                        "Event at {tag} does not advance the position {}",
                        self.position
                    )));
                }
                if outcome.handled {
                    if !outcome.emitted.is_empty() {
                        if !self.config.emit_enabled {
                            return Err(CoreFault::Fatal(format!(
                                "Handler emitted events at {tag} but emit is not enabled"
                            )));
                        }
                        let emitted: Vec<EmittedEvent> = outcome
                            .emitted
                            .into_iter()
                            .map(|emit| {
                                let mut event = EmittedEvent::new(
                                    emit.target_stream,
                                    emit.event_type,
                                    emit.data,
                                    tag.clone(),
                                );
                                event.expected_tag = emit.expected_tag;
                                event
                            })
                            .collect();
                        self.manager.events_emitted(emitted)?;
                    }
                    self.manager
                        .partition_state_updated(&partition, &self.partition_state(&partition), &tag)?;
                    self.events_processed_after_restart += 1;
                }
                self.position = tag.clone();
                if outcome.checkpoint_requested {
                    let state = self.root_state();
                    self.manager.checkpoint_suggested(tag, state)?;
                }
            }
            Output::Checkpoint(tag) => {
                if tag.is_after(&self.position)? {
                    self.position = tag.clone();
                }
                let state = self.root_state();
                self.manager.checkpoint_suggested(tag, state)?;
            }
            Output::Progress(progress) => {
                self.progress = progress;
            }
        }
        Ok(StageOutcome::Done)
    }

    fn update_backpressure(&mut self) {
        let pending = self.queue.pending_events();
        if !self.subscription_paused && pending > self.config.pending_events_threshold {
            debug!(projection = %self.name, pending, "Pausing subscription");
            self.subscription_paused = true;
            self.effects.push(ProjectionEffect::PauseSubscription);
        } else if self.subscription_paused && pending < self.config.pending_events_threshold {
            debug!(projection = %self.name, pending, "Resuming subscription");
            self.subscription_paused = false;
            self.effects.push(ProjectionEffect::ResumeSubscription);
        }
    }

    // ------------------------------------------------------------------
    // Faults, restart, shutdown
    // ------------------------------------------------------------------

    fn apply_fault(&mut self, fault: CoreFault) {
        match fault {
            CoreFault::Restart(reason) => self.initiate_restart(reason),
            CoreFault::Fatal(reason) => self.fault(reason),
        }
    }

    fn initiate_restart(&mut self, reason: String) {
        warn!(projection = %self.name, reason, "Restart requested");
        self.teardown();
        self.state = ProjectionState::Initial;
        if let Err(fault) = self.begin_start() {
            if let CoreFault::Fatal(reason) = fault {
                self.fault(reason);
            }
        }
    }

    fn fault(&mut self, reason: String) {
        if self.state == ProjectionState::Faulted {
            return;
        }
        error!(projection = %self.name, reason, "Projection faulted");
        self.faulted_reason = Some(reason);
        if self.state == ProjectionState::FaultedStopping {
            self.enter_faulted();
            return;
        }
        self.state = ProjectionState::FaultedStopping;
        self.subscription_id = None;
        self.effects.push(ProjectionEffect::Unsubscribe);
        // Best-effort final checkpoint; a failure here must not mask the
        // original fault.
        let state = self.root_state();
        if self
            .manager
            .checkpoint_suggested(self.position.clone(), state)
            .is_err()
        {
            self.enter_faulted();
        }
    }

    fn enter_faulted(&mut self) {
        self.state = ProjectionState::Faulted;
        self.io.cancel_all();
        self.manager.dispose();
        let reason = self
            .faulted_reason
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        self.publish(ManagementMessage::Faulted {
            name: self.name.clone(),
            reason,
        });
    }

    fn enter_stopped(&mut self) {
        self.state = ProjectionState::Stopped;
        self.io.cancel_all();
        self.manager.dispose();
        info!(projection = %self.name, "Projection stopped");
        self.publish(ManagementMessage::Stopped {
            name: self.name.clone(),
        });
    }

    fn teardown(&mut self) {
        self.effects.push(ProjectionEffect::Unsubscribe);
        self.subscription_id = None;
        self.expected_sequence = 0;
        self.io.cancel_all();
        self.manager.dispose();
        self.manager = CheckpointManager::new(
            self.names.clone(),
            self.io.clone(),
            if self.partition_state_persisted {
                WriteStrategy::Partitioned
            } else {
                WriteStrategy::Default
            },
            self.config.checkpoints_enabled,
            self.config.max_write_batch_length,
        );
        self.queue.reset();
        self.cache = PartitionStateCache::new(self.config.max_cached_partitions);
        self.loaded_partition = None;
        self.position = self.tagger.zero_tag();
        self.tick_pending = false;
        self.subscription_paused = false;
        self.stop_checkpoint_requested = false;
        self.events_processed_after_restart = 0;
        self.state_requests.clear();
    }

    fn after_dispatch(&mut self) {
        match self.state {
            ProjectionState::Stopping => {
                if !self.queue.is_empty() {
                    return;
                }
                if self.stop_write_checkpoint && !self.stop_checkpoint_requested {
                    self.stop_checkpoint_requested = true;
                    let state = self.root_state();
                    if let Err(fault) = self
                        .manager
                        .checkpoint_suggested(self.position.clone(), state)
                    {
                        self.apply_fault(fault.into());
                        return;
                    }
                }
                if self.manager.idle() {
                    self.enter_stopped();
                }
            }
            ProjectionState::FaultedStopping => {
                if self.manager.idle() {
                    self.enter_faulted();
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    pub fn statistics(&self) -> ProjectionStatistics {
        let pending_before = self
            .manager
            .checkpoint_tag_in_progress()
            .and_then(|tag| self.manager.pending_emits_before(tag).ok())
            .unwrap_or(0);
        let pending_total = self.manager.pending_emits();
        let writes_in_progress = self.manager.writes_in_progress();
        ProjectionStatistics {
            name: self.name.clone(),
            status: self.state.to_string(),
            position: self.position.to_string(),
            progress: self.progress,
            events_processed_after_restart: self.events_processed_after_restart,
            buffered_events: self.queue.len(),
            partitions_cached: self.cache.len(),
            write_pending_events_before_checkpoint: pending_before,
            write_pending_events_after_checkpoint: pending_total.saturating_sub(pending_before),
            reads_in_progress: self
                .io
                .outstanding_count()
                .saturating_sub(writes_in_progress),
            writes_in_progress,
            checkpoint_status: self.manager.checkpoint_status().to_string(),
            faulted_reason: self.faulted_reason.clone(),
        }
    }

    fn publish(&mut self, message: ManagementMessage) {
        self.effects.push(ProjectionEffect::Publish(message));
    }

    fn root_state(&self) -> String {
        self.cache
            .get_locked(ROOT_PARTITION)
            .map(|state| state.data.clone())
            .unwrap_or_default()
    }

    fn partition_state(&self, partition: &str) -> String {
        self.cache
            .peek(partition)
            .map(|state| state.data.clone())
            .unwrap_or_default()
    }
}

fn envelope_for(event: &ProjectionEvent, partition: String) -> EventEnvelope {
    EventEnvelope {
        partition,
        tag: event.tag.clone(),
        stream_id: event.stream_id.clone(),
        event_type: event.event_type.clone(),
        category: category_of(&event.stream_id).map(str::to_string),
        event_id: event.event_id,
        sequence: event.event_number,
        metadata: event.metadata.clone(),
        data: event.data.clone(),
    }
}
