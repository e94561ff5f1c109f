//! Per-stream emitted-event writer.
//!
//! Each derived stream a projection writes to gets one `EmittedStream`. The
//! writer delivers batches in caused-by order, recovers idempotently after a
//! restart by reconciling replayed emits against what is already in the
//! target stream, and detects foreign writers through expected-version
//! conflicts. Store timeouts retry the same batch forever with backoff; a
//! version conflict or a recovery mismatch asks the projection to restart.

use std::collections::VecDeque;
use std::fmt;

use backon::{BackoffBuilder, ExponentialBackoff};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::retry::{write_retry_backoff, MAX_RETRY_DELAY};
use crate::store::{
    BackwardReadCompleted, IoRoute, NewEvent, ProjectionIo, ReadResult, WriteCompleted,
    WriteResult, FROM_END, NO_STREAM,
};
use crate::tag::{CheckpointTag, TagError};

/// Result type for emitted stream operations.
pub type Result<T> = std::result::Result<T, EmitFault>;

/// Recovery reads page backward through the target stream.
const RECOVERY_PAGE_SIZE: usize = 100;

/// Why the writer cannot continue.
#[derive(Debug, thiserror::Error)]
pub enum EmitFault {
    /// A foreign writer or a divergent replay was detected; the projection
    /// must tear down and re-run recovery.
    #[error("Restart required: {0}")]
    Restart(String),

    /// Invariant violation or unsupported store behavior; fatal.
    #[error("{0}")]
    Fatal(String),
}

impl From<TagError> for EmitFault {
    fn from(error: TagError) -> Self {
        EmitFault::Fatal(error.to_string())
    }
}

/// Callback invoked exactly once with the committed event number.
pub type OnCommitted = Box<dyn FnOnce(i64) + Send>;

/// An event bound for a derived stream.
pub struct EmittedEvent {
    pub stream_id: String,
    pub event_id: Uuid,
    pub event_type: String,
    pub data: String,
    /// Input tag whose processing produced this event.
    pub caused_by: CheckpointTag,
    /// Tag the target stream must already reflect, when known.
    pub expected_tag: Option<CheckpointTag>,
    pub on_committed: Option<OnCommitted>,
}

impl EmittedEvent {
    pub fn new(
        stream_id: impl Into<String>,
        event_type: impl Into<String>,
        data: impl Into<String>,
        caused_by: CheckpointTag,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            data: data.into(),
            caused_by,
            expected_tag: None,
            on_committed: None,
        }
    }

    pub fn with_expected_tag(mut self, tag: CheckpointTag) -> Self {
        self.expected_tag = Some(tag);
        self
    }

    pub fn with_on_committed(mut self, on_committed: OnCommitted) -> Self {
        self.on_committed = Some(on_committed);
        self
    }
}

impl fmt::Debug for EmittedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmittedEvent")
            .field("stream_id", &self.stream_id)
            .field("event_id", &self.event_id)
            .field("event_type", &self.event_type)
            .field("caused_by", &self.caused_by)
            .field("expected_tag", &self.expected_tag)
            .finish_non_exhaustive()
    }
}

/// An already-committed event discovered during recovery.
#[derive(Debug, Clone)]
struct SeenEvent {
    tag: CheckpointTag,
    event_type: String,
    event_number: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    NotStarted,
    Recovering,
    Live,
}

struct InFlightBatch {
    events: Vec<EmittedEvent>,
    payload: Vec<NewEvent>,
    expected_version: i64,
    backoff: ExponentialBackoff,
    retries: u32,
}

/// Writer for one derived stream.
pub struct EmittedStream {
    stream_id: String,
    io: ProjectionIo,
    max_write_batch_length: usize,
    state: WriterState,
    /// Emits accepted but not yet submitted.
    ready: VecDeque<EmittedEvent>,
    /// Recovery stack; the last element is the oldest committed event.
    seen: Vec<SeenEvent>,
    last_committed_tag: Option<CheckpointTag>,
    last_submitted_or_committed: Option<CheckpointTag>,
    /// Newest tag accepted into `ready`; emits must not regress.
    last_queued_tag: Option<CheckpointTag>,
    /// Expected version for the next append.
    last_known_event_number: i64,
    head_captured: bool,
    in_flight: Option<InFlightBatch>,
    /// A retry delay timer is outstanding.
    retry_pending: bool,
    disposed: bool,
}

impl EmittedStream {
    pub fn new(stream_id: impl Into<String>, io: ProjectionIo, max_write_batch_length: usize) -> Self {
        Self {
            stream_id: stream_id.into(),
            io,
            max_write_batch_length,
            state: WriterState::NotStarted,
            ready: VecDeque::new(),
            seen: Vec::new(),
            last_committed_tag: None,
            last_submitted_or_committed: None,
            last_queued_tag: None,
            last_known_event_number: NO_STREAM,
            head_captured: false,
            in_flight: None,
            retry_pending: false,
            disposed: false,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Accept emits for this stream, in caused-by order.
    pub fn emit(&mut self, events: Vec<EmittedEvent>) -> Result<()> {
        for event in events {
            if event.stream_id != self.stream_id {
                return Err(EmitFault::Fatal(format!(
                    "Emit for stream {} routed to stream {}",
                    event.stream_id, self.stream_id
                )));
            }
            self.detect_concurrency_violation(&event)?;
            if let Some(last_queued) = &self.last_queued_tag {
                if event.caused_by.try_cmp(last_queued)? == std::cmp::Ordering::Less {
                    return Err(EmitFault::Fatal(format!(
                        "Emit to {} at {} regresses behind {}",
                        self.stream_id, event.caused_by, last_queued
                    )));
                }
            }
            self.last_queued_tag = Some(event.caused_by.clone());
            self.ready.push_back(event);
        }
        self.ensure_started();
        self.process_ready()
    }

    /// Recovery read completion.
    pub fn handle_recovery_read(&mut self, completed: BackwardReadCompleted) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        if self.state != WriterState::Recovering {
            return Err(EmitFault::Fatal(format!(
                "Unexpected recovery read for stream {}",
                self.stream_id
            )));
        }
        match completed.result {
            ReadResult::NoStream => {
                self.last_known_event_number = NO_STREAM;
                return self.finish_recovery();
            }
            ReadResult::Success => {}
            other => {
                return Err(EmitFault::Fatal(format!(
                    "Unsupported read result {other:?} recovering stream {}",
                    self.stream_id
                )));
            }
        }

        if !self.head_captured {
            self.last_known_event_number = completed.last_event_number;
            self.head_captured = true;
        }

        for event in &completed.events {
            match CheckpointTag::from_metadata(&event.metadata) {
                Ok(tag) => {
                    if self.last_committed_tag.is_none() {
                        self.last_committed_tag = Some(tag.clone());
                    }
                    self.seen.push(SeenEvent {
                        tag,
                        event_type: event.event_type.clone(),
                        event_number: event.event_number,
                    });
                }
                // Not written by a projection; skip it.
                Err(_) => trace!(
                    stream = %self.stream_id,
                    event_number = event.event_number,
                    "Untagged event skipped during recovery"
                ),
            }
        }

        if completed.next_event_number >= 0 {
            self.io.read_backward(
                IoRoute::EmittedRecovery {
                    stream: self.stream_id.clone(),
                },
                &self.stream_id,
                completed.next_event_number,
                RECOVERY_PAGE_SIZE,
            );
            return Ok(());
        }
        self.finish_recovery()
    }

    /// Batch write completion.
    pub fn handle_write_completed(&mut self, completed: WriteCompleted) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        if self.in_flight.is_none() {
            return Err(EmitFault::Fatal(format!(
                "Write completion for stream {} with no write in flight",
                self.stream_id
            )));
        }

        match completed.result {
            WriteResult::Success => {
                let Some(mut batch) = self.in_flight.take() else {
                    return Ok(());
                };
                self.last_known_event_number =
                    completed.first_event_number + batch.events.len() as i64 - 1;
                if let Some(last) = batch.events.last() {
                    self.last_committed_tag = Some(last.caused_by.clone());
                }
                debug!(
                    stream = %self.stream_id,
                    first = completed.first_event_number,
                    count = batch.events.len(),
                    "Emitted batch committed"
                );
                for (offset, event) in batch.events.iter_mut().enumerate() {
                    if let Some(on_committed) = event.on_committed.take() {
                        on_committed(completed.first_event_number + offset as i64);
                    }
                }
                self.process_ready()
            }
            WriteResult::WrongExpectedVersion => Err(EmitFault::Restart(format!(
                "Wrong expected version writing to stream {}; another writer is active",
                self.stream_id
            ))),
            result if result.is_timeout() => {
                let delay = match self.in_flight.as_mut() {
                    Some(batch) => {
                        batch.retries += 1;
                        warn!(
                            stream = %self.stream_id,
                            retries = batch.retries,
                            ?result,
                            "Emitted batch write timed out, retrying"
                        );
                        batch.backoff.next().unwrap_or(MAX_RETRY_DELAY)
                    }
                    None => MAX_RETRY_DELAY,
                };
                self.retry_pending = true;
                self.io.delay(
                    IoRoute::EmittedRetry {
                        stream: self.stream_id.clone(),
                    },
                    delay,
                );
                Ok(())
            }
            other => Err(EmitFault::Fatal(format!(
                "Unsupported write result {other:?} for stream {}",
                self.stream_id
            ))),
        }
    }

    /// Retry timer completion: resubmit the timed-out batch.
    pub fn handle_retry_timer(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.retry_pending = false;
        let Some(batch) = &self.in_flight else {
            return Ok(());
        };
        self.io.write(
            IoRoute::EmittedWrite {
                stream: self.stream_id.clone(),
            },
            &self.stream_id,
            batch.expected_version,
            batch.payload.clone(),
        );
        Ok(())
    }

    /// Emits not yet committed with caused-by at or before `tag`; a
    /// checkpoint at `tag` must wait until this reaches zero.
    pub fn pending_writes_before(&self, tag: &CheckpointTag) -> Result<usize> {
        let mut pending = 0;
        for event in &self.ready {
            if event.caused_by.is_at_or_before(tag)? {
                pending += 1;
            }
        }
        if let Some(batch) = &self.in_flight {
            for event in &batch.events {
                if event.caused_by.is_at_or_before(tag)? {
                    pending += 1;
                }
            }
        }
        Ok(pending)
    }

    /// All emits not yet committed.
    pub fn pending_writes(&self) -> usize {
        self.ready.len() + self.in_flight.as_ref().map_or(0, |batch| batch.events.len())
    }

    /// Events in the batch currently being written.
    pub fn writes_in_progress(&self) -> usize {
        self.in_flight.as_ref().map_or(0, |batch| batch.events.len())
    }

    /// Whether recovery is still reading the target stream.
    pub fn recovering(&self) -> bool {
        self.state == WriterState::Recovering
    }

    /// Drop the writer; late completions are ignored.
    pub fn dispose(&mut self) {
        self.disposed = true;
        self.ready.clear();
        self.in_flight = None;
    }

    fn ensure_started(&mut self) {
        if self.state != WriterState::NotStarted {
            return;
        }
        self.state = WriterState::Recovering;
        debug!(stream = %self.stream_id, "Emitted stream recovery started");
        self.io.read_backward(
            IoRoute::EmittedRecovery {
                stream: self.stream_id.clone(),
            },
            &self.stream_id,
            FROM_END,
            RECOVERY_PAGE_SIZE,
        );
    }

    fn finish_recovery(&mut self) -> Result<()> {
        self.state = WriterState::Live;
        self.last_submitted_or_committed = self.last_committed_tag.clone();
        debug!(
            stream = %self.stream_id,
            committed = self.seen.len(),
            last_known_event_number = self.last_known_event_number,
            "Emitted stream recovery complete"
        );
        self.process_ready()
    }

    fn detect_concurrency_violation(&self, event: &EmittedEvent) -> Result<()> {
        let (Some(expected), Some(last)) =
            (&event.expected_tag, &self.last_submitted_or_committed)
        else {
            return Ok(());
        };
        // Strictly less: an expected tag equal to the last submitted tag is
        // legal after a checkpoint at a non-emit position.
        if expected.try_cmp(last)? == std::cmp::Ordering::Less {
            return Err(EmitFault::Restart(format!(
                "Emit to {} expects tag {} but {} was already submitted",
                self.stream_id, expected, last
            )));
        }
        Ok(())
    }

    fn process_ready(&mut self) -> Result<()> {
        if self.state != WriterState::Live {
            return Ok(());
        }

        // Reconcile replayed emits against the committed tail.
        while let Some(front) = self.ready.front() {
            let already_committed = match &self.last_committed_tag {
                Some(last) => front.caused_by.is_at_or_before(last)?,
                None => false,
            };
            if !already_committed {
                break;
            }
            self.reconcile_front()?;
        }

        // Live mode: submit the next batch.
        if self.in_flight.is_none() && !self.retry_pending && !self.ready.is_empty() {
            self.submit_batch();
        }
        Ok(())
    }

    /// Match the front replayed emit against the oldest unmatched committed
    /// event; committed events older than the replay window are discarded.
    fn reconcile_front(&mut self) -> Result<()> {
        loop {
            enum Step {
                DiscardSeen,
                Matched,
            }
            let step = {
                let Some(front) = self.ready.front() else {
                    return Ok(());
                };
                let Some(oldest) = self.seen.last() else {
                    return Err(EmitFault::Restart(format!(
                        "Replayed emit at {} to {} has no committed counterpart",
                        front.caused_by, self.stream_id
                    )));
                };
                match oldest.tag.try_cmp(&front.caused_by)? {
                    // Committed before this replay's first emit; not
                    // re-emitted this time.
                    std::cmp::Ordering::Less => Step::DiscardSeen,
                    std::cmp::Ordering::Equal => {
                        if oldest.event_type != front.event_type {
                            return Err(EmitFault::Restart(format!(
                                "Replayed emit at {} to {} is {} but {} was committed",
                                front.caused_by,
                                self.stream_id,
                                front.event_type,
                                oldest.event_type
                            )));
                        }
                        Step::Matched
                    }
                    std::cmp::Ordering::Greater => {
                        return Err(EmitFault::Restart(format!(
                            "Replayed emit at {} to {} does not match committed event at {}",
                            front.caused_by, self.stream_id, oldest.tag
                        )));
                    }
                }
            };
            match step {
                Step::DiscardSeen => {
                    self.seen.pop();
                }
                Step::Matched => {
                    let (Some(matched), Some(mut event)) =
                        (self.seen.pop(), self.ready.pop_front())
                    else {
                        return Ok(());
                    };
                    trace!(
                        stream = %self.stream_id,
                        tag = %matched.tag,
                        event_number = matched.event_number,
                        "Replayed emit matched committed event"
                    );
                    if self.advance_submitted(&matched.tag)? {
                        self.last_submitted_or_committed = Some(matched.tag);
                    }
                    if let Some(on_committed) = event.on_committed.take() {
                        on_committed(matched.event_number);
                    }
                    return Ok(());
                }
            }
        }
    }

    fn submit_batch(&mut self) {
        let batch_length = self.ready.len().min(self.max_write_batch_length);
        let events: Vec<EmittedEvent> = self.ready.drain(..batch_length).collect();
        let payload: Vec<NewEvent> = events
            .iter()
            .map(|event| NewEvent {
                event_id: event.event_id,
                event_type: event.event_type.clone(),
                data: event.data.clone(),
                metadata: event.caused_by.to_metadata(),
            })
            .collect();
        if let Some(last) = events.last() {
            self.last_submitted_or_committed = Some(last.caused_by.clone());
        }
        let expected_version = self.last_known_event_number;
        debug!(
            stream = %self.stream_id,
            count = events.len(),
            expected_version,
            "Submitting emitted batch"
        );
        self.io.write(
            IoRoute::EmittedWrite {
                stream: self.stream_id.clone(),
            },
            &self.stream_id,
            expected_version,
            payload.clone(),
        );
        self.in_flight = Some(InFlightBatch {
            events,
            payload,
            expected_version,
            backoff: write_retry_backoff().build(),
            retries: 0,
        });
    }

    fn advance_submitted(&self, tag: &CheckpointTag) -> Result<bool> {
        match &self.last_submitted_or_committed {
            Some(last) => Ok(tag.is_after(last)?),
            None => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests;
