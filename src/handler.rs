//! User projection handler interface.
//!
//! A handler is the deterministic fold supplied by the user: it resolves an
//! event to a partition, folds the event over that partition's state, and
//! may emit events to derived streams. Handlers run synchronously on the
//! projection's worker; implementations needing mutable state own it
//! directly (`&mut self`).

use uuid::Uuid;

use crate::tag::CheckpointTag;

/// Result type for handler operations.
pub type Result<T> = std::result::Result<T, HandlerError>;

/// A failure inside user projection code.
///
/// Caught at the single process-event call site; faults the projection with
/// the message and position recorded.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The event a handler processes.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    /// Partition the event resolved to (`""` for the root).
    pub partition: String,
    /// Checkpoint tag assigned by the subscription.
    pub tag: CheckpointTag,
    pub stream_id: String,
    pub event_type: String,
    /// Stream category, when the stream id has one.
    pub category: Option<String>,
    pub event_id: Uuid,
    /// Event number within its stream.
    pub sequence: i64,
    pub metadata: String,
    pub data: String,
}

/// An emit produced by the handler, before the runtime assigns ids and
/// caused-by metadata.
#[derive(Debug, Clone)]
pub struct PendingEmit {
    pub target_stream: String,
    pub event_type: String,
    pub data: String,
    /// Tag the target stream must already reflect; enables concurrent-writer
    /// detection across projection-owned streams.
    pub expected_tag: Option<CheckpointTag>,
}

impl PendingEmit {
    pub fn new(
        target_stream: impl Into<String>,
        event_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            target_stream: target_stream.into(),
            event_type: event_type.into(),
            data: data.into(),
            expected_tag: None,
        }
    }

    pub fn with_expected_tag(mut self, tag: CheckpointTag) -> Self {
        self.expected_tag = Some(tag);
        self
    }
}

/// What processing one event produced.
#[derive(Debug, Clone)]
pub struct ProcessingOutcome {
    /// The partition's state after the fold.
    pub new_state: String,
    pub emitted: Vec<PendingEmit>,
    /// False when the handler inspected the event and chose to ignore it.
    pub handled: bool,
    /// The handler asks for a checkpoint at this event's tag.
    pub checkpoint_requested: bool,
}

impl ProcessingOutcome {
    /// The event was folded into `new_state`.
    pub fn handled(new_state: impl Into<String>) -> Self {
        Self {
            new_state: new_state.into(),
            emitted: Vec::new(),
            handled: true,
            checkpoint_requested: false,
        }
    }

    /// The event was ignored; state is unchanged.
    pub fn unhandled(state: impl Into<String>) -> Self {
        Self {
            new_state: state.into(),
            emitted: Vec::new(),
            handled: false,
            checkpoint_requested: false,
        }
    }

    pub fn with_emits(mut self, emitted: Vec<PendingEmit>) -> Self {
        self.emitted = emitted;
        self
    }

    pub fn with_checkpoint_request(mut self) -> Self {
        self.checkpoint_requested = true;
        self
    }
}

/// User-supplied projection logic.
pub trait ProjectionHandler: Send {
    /// Reset to initial state. Called once before first use and again after
    /// every restart, before `load`.
    fn initialize(&mut self) -> Result<()>;

    /// Restore from a persisted state blob (`""` for a fresh partition).
    fn load(&mut self, state: &str) -> Result<()>;

    /// Resolve the partition an event belongs to; `""` is the root
    /// partition. Global projections keep the default.
    fn partition_of(&self, _envelope: &EventEnvelope) -> String {
        String::new()
    }

    /// Whether this handler partitions its state. Partitioned handlers get
    /// per-partition state persistence and a partition catalog.
    fn is_partitioned(&self) -> bool {
        false
    }

    /// Fold one event over the currently loaded state.
    fn process_event(&mut self, envelope: &EventEnvelope) -> Result<ProcessingOutcome>;

    /// Tear down. Called exactly once when the projection is disposed.
    fn dispose(&mut self) {}
}
