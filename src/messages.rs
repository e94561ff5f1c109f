//! Message types flowing between the subscription, the projection core, and
//! the management surface.

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::stats::ProjectionStatistics;
use crate::tag::CheckpointTag;

/// An input event after filtering and tagging.
#[derive(Debug, Clone)]
pub struct ProjectionEvent {
    pub tag: CheckpointTag,
    pub stream_id: String,
    pub event_number: i64,
    pub event_id: Uuid,
    pub event_type: String,
    pub data: String,
    pub metadata: String,
}

/// Payloads produced by the subscription.
#[derive(Debug, Clone)]
pub enum SubscriptionMessage {
    EventReceived(ProjectionEvent),
    CheckpointSuggested { tag: CheckpointTag },
    ProgressChanged { progress: f32 },
    EofReached,
}

/// A subscription payload stamped with its origin and order.
///
/// The projection drops messages from a stale subscription id and faults on
/// a sequence gap within the live one.
#[derive(Debug, Clone)]
pub struct SequencedMessage {
    pub subscription_id: Uuid,
    pub sequence: u64,
    pub payload: SubscriptionMessage,
}

/// Commands accepted by a running projection.
#[derive(Debug)]
pub enum ProjectionCommand {
    /// Load state and run.
    Start,
    /// Load state but stay stopped.
    LoadStopped,
    /// Stop, optionally persisting a final checkpoint first.
    Stop { write_checkpoint: bool },
    /// Report a partition's state.
    GetState {
        partition: String,
        reply: oneshot::Sender<Option<String>>,
    },
    /// Report the recent event trail.
    GetDebugState {
        reply: oneshot::Sender<Vec<ProjectionEvent>>,
    },
    /// Report statistics.
    GetStatistics {
        reply: oneshot::Sender<ProjectionStatistics>,
    },
}

/// Notifications published to the management surface.
#[derive(Debug)]
pub enum ManagementMessage {
    Started {
        name: String,
    },
    Stopped {
        name: String,
    },
    Faulted {
        name: String,
        reason: String,
    },
    StatisticsReport {
        name: String,
        statistics: Box<ProjectionStatistics>,
    },
    StateReport {
        name: String,
        partition: String,
        state: Option<String>,
    },
    DebugState {
        name: String,
        events: Vec<ProjectionEvent>,
    },
}
