//! Asterism - projection runtime core
//!
//! A runtime for user-defined projections over an ordered event log:
//! deterministic folds from committed events into derived state, with
//! optional emits to derived streams. Guarantees exactly-once effective
//! processing across crash-recovery, at most one concurrent writer per
//! derived stream, and monotonic checkpointed progress.

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod emitted;
pub mod filter;
pub mod handler;
pub mod messages;
pub mod naming;
pub mod projection;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod store;
pub mod subscription;
pub mod tag;

// Re-export common types for library usage
pub use config::ProjectionConfig;
pub use filter::EventFilter;
pub use handler::{EventEnvelope, HandlerError, PendingEmit, ProcessingOutcome, ProjectionHandler};
pub use messages::{ManagementMessage, ProjectionCommand, ProjectionEvent};
pub use projection::{spawn_projection, CoreProjection, ProjectionHandle, ProjectionState};
pub use stats::ProjectionStatistics;
pub use store::{EventLog, InMemoryLog};
pub use tag::{CheckpointTag, PositionTagger};
