//! Request/reply bridge between a projection and the event log.
//!
//! Projection components never await the log directly; they send an
//! [`IoEnvelope`] and later receive an [`IoCompleted`] on the projection's
//! inbox. Every envelope carries a correlation id registered in a shared
//! outstanding set; a restart clears the set, so late replies are dropped
//! instead of reaching a component that no longer expects them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{BackwardReadCompleted, EventLog, NewEvent, WriteCompleted};

/// Which component a completion is routed back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoRoute {
    /// Checkpoint manager: loading the checkpoint stream.
    CheckpointLoad,
    /// Checkpoint manager: writing a checkpoint.
    CheckpointWrite,
    /// Checkpoint manager: backoff delay before a checkpoint retry.
    CheckpointRetry,
    /// Emitted stream recovery read.
    EmittedRecovery { stream: String },
    /// Emitted stream batch write.
    EmittedWrite { stream: String },
    /// Emitted stream backoff delay before a write retry.
    EmittedRetry { stream: String },
    /// Staged queue: loading partition state for a suspended work item.
    PartitionLoad { item: u64 },
    /// Management state request for an uncached partition.
    StateRequest { request: u64 },
}

/// A request to the event log (or the timer, for retry backoff).
#[derive(Debug)]
pub enum IoRequest {
    ReadBackward {
        stream: String,
        from: i64,
        max_count: usize,
    },
    Write {
        stream: String,
        expected_version: i64,
        events: Vec<NewEvent>,
    },
    Delay {
        duration: Duration,
    },
}

/// A routed request with its correlation id.
#[derive(Debug)]
pub struct IoEnvelope {
    pub correlation_id: Uuid,
    pub route: IoRoute,
    pub request: IoRequest,
}

/// The payload of a completed request.
#[derive(Debug)]
pub enum IoCompletion {
    ReadBackward(BackwardReadCompleted),
    Write(WriteCompleted),
    TimerFired,
}

/// A completed request, delivered to the projection inbox.
#[derive(Debug)]
pub struct IoCompleted {
    pub correlation_id: Uuid,
    pub route: IoRoute,
    pub completion: IoCompletion,
}

/// Handle used by projection components to issue log requests.
///
/// Cloneable; all clones share one outstanding-request set so a single
/// `cancel_all` invalidates every in-flight request.
#[derive(Clone)]
pub struct ProjectionIo {
    requests: mpsc::UnboundedSender<IoEnvelope>,
    outstanding: Arc<Mutex<HashSet<Uuid>>>,
}

impl ProjectionIo {
    pub fn new(requests: mpsc::UnboundedSender<IoEnvelope>) -> Self {
        Self {
            requests,
            outstanding: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Issue a backward read.
    pub fn read_backward(&self, route: IoRoute, stream: &str, from: i64, max_count: usize) -> Uuid {
        self.send(
            route,
            IoRequest::ReadBackward {
                stream: stream.to_string(),
                from,
                max_count,
            },
        )
    }

    /// Issue an append.
    pub fn write(
        &self,
        route: IoRoute,
        stream: &str,
        expected_version: i64,
        events: Vec<NewEvent>,
    ) -> Uuid {
        self.send(
            route,
            IoRequest::Write {
                stream: stream.to_string(),
                expected_version,
                events,
            },
        )
    }

    /// Schedule a timer completion after `duration`.
    pub fn delay(&self, route: IoRoute, duration: Duration) -> Uuid {
        self.send(route, IoRequest::Delay { duration })
    }

    /// Whether `correlation_id` is still expected; removes it if so.
    ///
    /// The projection calls this for every inbound completion. Replies whose
    /// id was cancelled (or already consumed) return false and must be
    /// dropped.
    pub fn take(&self, correlation_id: Uuid) -> bool {
        self.outstanding
            .lock()
            .map(|mut outstanding| outstanding.remove(&correlation_id))
            .unwrap_or(false)
    }

    /// Cancel every outstanding request.
    pub fn cancel_all(&self) {
        if let Ok(mut outstanding) = self.outstanding.lock() {
            let cancelled = outstanding.len();
            outstanding.clear();
            if cancelled > 0 {
                debug!(cancelled, "Cancelled outstanding log requests");
            }
        }
    }

    /// Number of requests awaiting completion.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding
            .lock()
            .map(|outstanding| outstanding.len())
            .unwrap_or(0)
    }

    fn send(&self, route: IoRoute, request: IoRequest) -> Uuid {
        let correlation_id = Uuid::new_v4();
        if let Ok(mut outstanding) = self.outstanding.lock() {
            outstanding.insert(correlation_id);
        }
        trace!(%correlation_id, ?route, "Issuing log request");
        // A closed channel means the runner is shutting down; the request
        // simply never completes.
        let _ = self.requests.send(IoEnvelope {
            correlation_id,
            route,
            request,
        });
        correlation_id
    }
}

/// Spawn the dispatcher task.
///
/// Each envelope runs on its own task so reads and writes to different
/// streams overlap; completions are funneled into `replies`.
pub fn spawn_dispatcher(
    log: Arc<dyn EventLog>,
    mut requests: mpsc::UnboundedReceiver<IoEnvelope>,
    replies: mpsc::UnboundedSender<IoCompleted>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = requests.recv().await {
            let log = Arc::clone(&log);
            let replies = replies.clone();
            tokio::spawn(async move {
                let IoEnvelope {
                    correlation_id,
                    route,
                    request,
                } = envelope;
                let completion = match request {
                    IoRequest::ReadBackward {
                        stream,
                        from,
                        max_count,
                    } => IoCompletion::ReadBackward(
                        log.read_stream_backward(&stream, from, max_count).await,
                    ),
                    IoRequest::Write {
                        stream,
                        expected_version,
                        events,
                    } => IoCompletion::Write(
                        log.write_events(&stream, expected_version, events).await,
                    ),
                    IoRequest::Delay { duration } => {
                        tokio::time::sleep(duration).await;
                        IoCompletion::TimerFired
                    }
                };
                let _ = replies.send(IoCompleted {
                    correlation_id,
                    route,
                    completion,
                });
            });
        }
    })
}
