//! Projection statistics reporting.

use serde::Serialize;

/// A point-in-time statistics report for one projection.
///
/// Served on demand through the management surface; transient conditions
/// (retrying writes, parked checkpoints) are visible here rather than as
/// errors.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectionStatistics {
    pub name: String,
    /// Lifecycle state, rendered.
    pub status: String,
    /// Current checkpoint tag, rendered; empty before load completes.
    pub position: String,
    /// Source progress percentage as last reported by the subscription.
    pub progress: f32,
    pub events_processed_after_restart: u64,
    /// Work items buffered in the staged queue.
    pub buffered_events: usize,
    pub partitions_cached: usize,
    /// Emits awaiting write for tags at or before the parked checkpoint.
    pub write_pending_events_before_checkpoint: usize,
    /// Emits awaiting write for tags after the parked checkpoint.
    pub write_pending_events_after_checkpoint: usize,
    pub reads_in_progress: usize,
    pub writes_in_progress: usize,
    /// "", "requested", or "writing".
    pub checkpoint_status: String,
    pub faulted_reason: Option<String>,
}
