//! Event log client interface.
//!
//! The projection runtime consumes exactly three operations from the event
//! log: backward stream reads, appends with optimistic concurrency, and live
//! subscriptions from a position. Outcomes are result codes rather than
//! errors; any code outside the documented sets is fatal to the projection.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::filter::EventFilter;

mod dispatcher;
mod memory;

pub use dispatcher::{
    spawn_dispatcher, IoCompleted, IoCompletion, IoEnvelope, IoRequest, IoRoute, ProjectionIo,
};
pub use memory::InMemoryLog;

/// Expected version for a stream that must not exist yet.
pub const NO_STREAM: i64 = -1;

/// Sentinel "read from the end" event number for backward reads.
pub const FROM_END: i64 = -1;

/// A position in the global event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogPosition {
    pub commit: i64,
    pub prepare: i64,
}

impl LogPosition {
    /// The position before the first event.
    pub const START: LogPosition = LogPosition {
        commit: 0,
        prepare: -1,
    };
}

/// An event as stored in a stream.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub stream_id: String,
    pub event_number: i64,
    pub event_id: Uuid,
    pub event_type: String,
    pub data: String,
    pub metadata: String,
}

/// An event delivered by a live subscription, with its global position.
#[derive(Debug, Clone)]
pub struct CommittedEvent {
    pub event: RecordedEvent,
    pub position: LogPosition,
    /// How far through the log this subscription has progressed, in percent.
    pub progress: f32,
}

/// A record on the subscription stream.
#[derive(Debug, Clone)]
pub enum SourceRecord {
    Event(CommittedEvent),
    /// The source has delivered everything it will deliver.
    Eof,
}

/// Where a subscription starts.
#[derive(Debug, Clone)]
pub enum SubscribePosition {
    /// After this global position.
    Log(LogPosition),
    /// After these per-stream event numbers.
    Streams(BTreeMap<String, i64>),
}

/// Outcome of a backward stream read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    Success,
    NoStream,
    StreamDeleted,
    NotModified,
    Error,
}

/// Outcome of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Success,
    WrongExpectedVersion,
    PrepareTimeout,
    ForwardTimeout,
    CommitTimeout,
    StreamDeleted,
    AccessDenied,
}

impl WriteResult {
    /// Timeouts are transient; the same write is retried with backoff.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            WriteResult::PrepareTimeout | WriteResult::ForwardTimeout | WriteResult::CommitTimeout
        )
    }
}

/// Completion of `read_stream_backward`.
#[derive(Debug, Clone)]
pub struct BackwardReadCompleted {
    pub result: ReadResult,
    /// Events in reverse stream order (newest first).
    pub events: Vec<RecordedEvent>,
    /// Where the next backward page starts; negative once the stream start
    /// has been passed.
    pub next_event_number: i64,
    /// The stream's head event number at read time.
    pub last_event_number: i64,
}

impl BackwardReadCompleted {
    /// A completion for a stream that does not exist.
    pub fn no_stream() -> Self {
        Self {
            result: ReadResult::NoStream,
            events: Vec::new(),
            next_event_number: -1,
            last_event_number: -1,
        }
    }
}

/// Completion of `write_events`.
#[derive(Debug, Clone)]
pub struct WriteCompleted {
    pub result: WriteResult,
    /// Stream position of the first appended event (on success).
    pub first_event_number: i64,
}

/// An event to append.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub data: String,
    pub metadata: String,
}

/// The event log operations the runtime consumes.
///
/// Implementations wrap whatever transport the surrounding system uses; the
/// in-tree [`InMemoryLog`] backs tests and embedded use.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Read a stream backward from `from` (or [`FROM_END`]), up to
    /// `max_count` events.
    async fn read_stream_backward(
        &self,
        stream: &str,
        from: i64,
        max_count: usize,
    ) -> BackwardReadCompleted;

    /// Append events with optimistic concurrency against `expected_version`
    /// ([`NO_STREAM`] when the stream must not exist).
    async fn write_events(
        &self,
        stream: &str,
        expected_version: i64,
        events: Vec<NewEvent>,
    ) -> WriteCompleted;

    /// Subscribe to committed events after `position`. The filter is a
    /// source-side hint; the subscription layer re-checks every record.
    async fn subscribe_from(
        &self,
        position: SubscribePosition,
        filter: EventFilter,
    ) -> ReceiverStream<SourceRecord>;
}

#[cfg(test)]
mod tests;
