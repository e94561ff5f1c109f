//! Checkpoint manager.
//!
//! Loads the projection's last persisted position at startup, persists new
//! checkpoints when suggested, and gates every checkpoint on the emitted
//! streams: a checkpoint at tag T is not written while any emit caused by a
//! tag at or before T is still unwritten. The manager owns the emitted
//! streams; the partitioned write strategy additionally persists partition
//! state and a partition catalog through them.

use std::collections::{HashMap, HashSet};

use backon::{BackoffBuilder, ExponentialBackoff};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::ROOT_PARTITION;
use crate::emitted::{EmitFault, EmittedEvent, EmittedStream};
use crate::naming::{
    StreamNames, CHECKPOINT_EVENT_TYPE, PARTITION_EVENT_TYPE, STATE_UPDATED_EVENT_TYPE,
};
use crate::retry::{write_retry_backoff, MAX_RETRY_DELAY};
use crate::store::{
    BackwardReadCompleted, IoCompletion, IoRoute, NewEvent, ProjectionIo, ReadResult,
    WriteCompleted, WriteResult, FROM_END, NO_STREAM,
};
use crate::tag::CheckpointTag;

/// Result type for checkpoint operations.
pub type Result<T> = std::result::Result<T, EmitFault>;

/// Checkpoint stream reads page backward in small pages.
const CHECKPOINT_PAGE_SIZE: usize = 10;

/// How partition state is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Root state only, inside the checkpoint event.
    Default,
    /// Additionally persist per-partition state streams and a partition
    /// catalog.
    Partitioned,
}

/// Result of loading the checkpoint stream.
#[derive(Debug, Clone)]
pub struct CheckpointLoaded {
    pub tag: Option<CheckpointTag>,
    pub state: String,
}

#[derive(Debug)]
struct PendingCheckpoint {
    tag: CheckpointTag,
    state: String,
}

struct WritingCheckpoint {
    tag: CheckpointTag,
    payload: NewEvent,
    expected_version: i64,
    backoff: ExponentialBackoff,
    retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    Created,
    Loading,
    Ready,
}

/// Coordinates checkpoint persistence with emitted-stream drain.
pub struct CheckpointManager {
    names: StreamNames,
    io: ProjectionIo,
    strategy: WriteStrategy,
    checkpoints_enabled: bool,
    max_write_batch_length: usize,
    state: ManagerState,
    /// Expected version for the next checkpoint write.
    last_checkpoint_event_number: i64,
    last_completed: Option<CheckpointTag>,
    requested: Option<PendingCheckpoint>,
    writing: Option<WritingCheckpoint>,
    streams: HashMap<String, EmittedStream>,
    known_partitions: HashSet<String>,
}

impl CheckpointManager {
    pub fn new(
        names: StreamNames,
        io: ProjectionIo,
        strategy: WriteStrategy,
        checkpoints_enabled: bool,
        max_write_batch_length: usize,
    ) -> Self {
        Self {
            names,
            io,
            strategy,
            checkpoints_enabled,
            max_write_batch_length,
            state: ManagerState::Created,
            last_checkpoint_event_number: NO_STREAM,
            last_completed: None,
            requested: None,
            writing: None,
            streams: HashMap::new(),
            known_partitions: HashSet::new(),
        }
    }

    // ------------------------------------------------------------------
    // Load
    // ------------------------------------------------------------------

    /// Start reading the checkpoint stream backward.
    pub fn begin_load(&mut self) {
        self.state = ManagerState::Loading;
        self.io.read_backward(
            IoRoute::CheckpointLoad,
            &self.names.checkpoint_stream(),
            FROM_END,
            CHECKPOINT_PAGE_SIZE,
        );
    }

    /// Handle a page of the checkpoint stream. Returns the loaded
    /// checkpoint once found (or once the stream is exhausted).
    pub fn handle_load_read(
        &mut self,
        completed: BackwardReadCompleted,
    ) -> Result<Option<CheckpointLoaded>> {
        if self.state != ManagerState::Loading {
            return Err(EmitFault::Fatal(
                "Checkpoint load completed while not loading".to_string(),
            ));
        }
        match completed.result {
            ReadResult::NoStream => {
                self.state = ManagerState::Ready;
                info!(projection = %self.names.projection(), "No checkpoint found, starting fresh");
                return Ok(Some(CheckpointLoaded {
                    tag: None,
                    state: String::new(),
                }));
            }
            ReadResult::Success => {}
            other => {
                return Err(EmitFault::Fatal(format!(
                    "Unsupported read result {other:?} loading checkpoint stream"
                )));
            }
        }

        for event in &completed.events {
            if event.event_type != CHECKPOINT_EVENT_TYPE {
                continue;
            }
            let tag = CheckpointTag::from_metadata(&event.metadata)
                .map_err(|error| EmitFault::Fatal(error.to_string()))?;
            self.last_checkpoint_event_number = event.event_number;
            self.last_completed = Some(tag.clone());
            self.state = ManagerState::Ready;
            info!(
                projection = %self.names.projection(),
                tag = %tag,
                event_number = event.event_number,
                "Checkpoint loaded"
            );
            return Ok(Some(CheckpointLoaded {
                tag: Some(tag),
                state: event.data.clone(),
            }));
        }

        if completed.next_event_number >= 0 {
            self.io.read_backward(
                IoRoute::CheckpointLoad,
                &self.names.checkpoint_stream(),
                completed.next_event_number,
                CHECKPOINT_PAGE_SIZE,
            );
            return Ok(None);
        }

        self.state = ManagerState::Ready;
        info!(projection = %self.names.projection(), "Checkpoint stream held no checkpoint, starting fresh");
        Ok(Some(CheckpointLoaded {
            tag: None,
            state: String::new(),
        }))
    }

    // ------------------------------------------------------------------
    // Emits
    // ------------------------------------------------------------------

    /// Route emitted events to their per-stream writers.
    pub fn events_emitted(&mut self, events: Vec<EmittedEvent>) -> Result<()> {
        for event in events {
            let stream_id = event.stream_id.clone();
            self.stream_for(&stream_id).emit(vec![event])?;
        }
        Ok(())
    }

    /// Register a partition the projection just created.
    ///
    /// The partitioned strategy appends one catalog entry per partition key
    /// first encountered; recovery dedup makes the append idempotent across
    /// restarts.
    pub fn partition_created(&mut self, partition: &str, at_tag: &CheckpointTag) -> Result<()> {
        if self.strategy != WriteStrategy::Partitioned || partition == ROOT_PARTITION {
            return Ok(());
        }
        if !self.known_partitions.insert(partition.to_string()) {
            return Ok(());
        }
        debug!(partition, tag = %at_tag, "Partition registered");
        let catalog = self.names.partition_catalog_stream();
        let event = EmittedEvent::new(
            catalog.clone(),
            PARTITION_EVENT_TYPE,
            partition.to_string(),
            at_tag.clone(),
        );
        self.stream_for(&catalog).emit(vec![event])
    }

    /// Persist a partition's new state.
    pub fn partition_state_updated(
        &mut self,
        partition: &str,
        state: &str,
        caused_by: &CheckpointTag,
    ) -> Result<()> {
        if self.strategy != WriteStrategy::Partitioned || partition == ROOT_PARTITION {
            return Ok(());
        }
        let stream_id = self.names.partition_state_stream(partition);
        let event = EmittedEvent::new(
            stream_id.clone(),
            STATE_UPDATED_EVENT_TYPE,
            state.to_string(),
            caused_by.clone(),
        );
        self.stream_for(&stream_id).emit(vec![event])
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Park a checkpoint request at `tag` with the root state to persist.
    ///
    /// The write starts once every emitted stream has drained its writes at
    /// or before `tag`; call [`poll`](Self::poll) after completions arrive.
    pub fn checkpoint_suggested(&mut self, tag: CheckpointTag, state: String) -> Result<()> {
        if !self.checkpoints_enabled || self.state != ManagerState::Ready {
            return Ok(());
        }
        if let Some(completed) = &self.last_completed {
            if tag.is_at_or_before(completed).map_err(EmitFault::from)? {
                return Ok(());
            }
        }
        if let Some(requested) = &self.requested {
            if tag
                .is_at_or_before(&requested.tag)
                .map_err(EmitFault::from)?
            {
                return Ok(());
            }
        }
        if let Some(writing) = &self.writing {
            if tag.is_at_or_before(&writing.tag).map_err(EmitFault::from)? {
                return Ok(());
            }
        }
        debug!(tag = %tag, "Checkpoint requested");
        self.requested = Some(PendingCheckpoint { tag, state });
        self.poll()
    }

    /// Start the parked checkpoint write if its emits have drained.
    pub fn poll(&mut self) -> Result<()> {
        if self.state != ManagerState::Ready || self.writing.is_some() {
            return Ok(());
        }
        let Some(requested) = &self.requested else {
            return Ok(());
        };
        for stream in self.streams.values() {
            if stream.pending_writes_before(&requested.tag)? > 0 {
                return Ok(());
            }
        }
        let Some(PendingCheckpoint { tag, state }) = self.requested.take() else {
            return Ok(());
        };
        let payload = NewEvent {
            event_id: Uuid::new_v4(),
            event_type: CHECKPOINT_EVENT_TYPE.to_string(),
            data: state,
            metadata: tag.to_metadata(),
        };
        debug!(
            tag = %tag,
            expected_version = self.last_checkpoint_event_number,
            "Writing checkpoint"
        );
        self.io.write(
            IoRoute::CheckpointWrite,
            &self.names.checkpoint_stream(),
            self.last_checkpoint_event_number,
            vec![payload.clone()],
        );
        self.writing = Some(WritingCheckpoint {
            tag,
            payload,
            expected_version: self.last_checkpoint_event_number,
            backoff: write_retry_backoff().build(),
            retries: 0,
        });
        Ok(())
    }

    /// Handle the checkpoint write completion. Returns the completed tag
    /// when the checkpoint persisted.
    pub fn handle_write_completed(
        &mut self,
        completed: WriteCompleted,
    ) -> Result<Option<CheckpointTag>> {
        if self.writing.is_none() {
            return Err(EmitFault::Fatal(
                "Checkpoint write completed with no checkpoint in flight".to_string(),
            ));
        }

        match completed.result {
            WriteResult::Success => {
                let Some(writing) = self.writing.take() else {
                    return Ok(None);
                };
                self.last_checkpoint_event_number = completed.first_event_number;
                self.last_completed = Some(writing.tag.clone());
                info!(tag = %writing.tag, "Checkpoint completed");
                // A newer suggestion may already be parked.
                self.poll()?;
                Ok(Some(writing.tag))
            }
            WriteResult::WrongExpectedVersion => Err(EmitFault::Restart(format!(
                "Wrong expected version writing checkpoint for {}; another instance is active",
                self.names.projection()
            ))),
            result if result.is_timeout() => {
                let delay = match self.writing.as_mut() {
                    Some(writing) => {
                        writing.retries += 1;
                        warn!(
                            retries = writing.retries,
                            ?result,
                            "Checkpoint write timed out, retrying"
                        );
                        writing.backoff.next().unwrap_or(MAX_RETRY_DELAY)
                    }
                    None => MAX_RETRY_DELAY,
                };
                self.io.delay(IoRoute::CheckpointRetry, delay);
                Ok(None)
            }
            other => Err(EmitFault::Fatal(format!(
                "Unsupported write result {other:?} writing checkpoint"
            ))),
        }
    }

    /// Retry timer completion: resubmit the timed-out checkpoint write.
    pub fn handle_retry_timer(&mut self) -> Result<()> {
        let Some(writing) = &self.writing else {
            return Ok(());
        };
        self.io.write(
            IoRoute::CheckpointWrite,
            &self.names.checkpoint_stream(),
            writing.expected_version,
            vec![writing.payload.clone()],
        );
        Ok(())
    }

    /// Route an emitted-stream completion to its writer.
    pub fn handle_emitted_io(
        &mut self,
        route: &IoRoute,
        completion: IoCompletion,
    ) -> Result<()> {
        let (stream_id, completion) = match (route, completion) {
            (IoRoute::EmittedRecovery { stream }, IoCompletion::ReadBackward(read)) => {
                let Some(writer) = self.streams.get_mut(stream) else {
                    return Ok(());
                };
                return writer.handle_recovery_read(read);
            }
            (IoRoute::EmittedWrite { stream }, IoCompletion::Write(write)) => (stream, write),
            (IoRoute::EmittedRetry { stream }, IoCompletion::TimerFired) => {
                let Some(writer) = self.streams.get_mut(stream) else {
                    return Ok(());
                };
                return writer.handle_retry_timer();
            }
            (route, completion) => {
                return Err(EmitFault::Fatal(format!(
                    "Mismatched completion {completion:?} for route {route:?}"
                )));
            }
        };
        let Some(writer) = self.streams.get_mut(stream_id) else {
            return Ok(());
        };
        writer.handle_write_completed(completion)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// No checkpoint parked or writing, and every emitted stream drained.
    pub fn idle(&self) -> bool {
        self.requested.is_none()
            && self.writing.is_none()
            && self
                .streams
                .values()
                .all(|stream| stream.pending_writes() == 0 && !stream.recovering())
    }

    /// Emits not yet committed across all streams.
    pub fn pending_emits(&self) -> usize {
        self.streams
            .values()
            .map(|stream| stream.pending_writes())
            .sum()
    }

    /// Emits not yet committed at or before `tag`.
    pub fn pending_emits_before(&self, tag: &CheckpointTag) -> Result<usize> {
        let mut pending = 0;
        for stream in self.streams.values() {
            pending += stream.pending_writes_before(tag)?;
        }
        Ok(pending)
    }

    /// Events in batches currently being written.
    pub fn writes_in_progress(&self) -> usize {
        let checkpoint_write = usize::from(self.writing.is_some());
        checkpoint_write
            + self
                .streams
                .values()
                .map(|stream| stream.writes_in_progress())
                .sum::<usize>()
    }

    /// The tag of the parked or in-flight checkpoint, if any.
    pub fn checkpoint_tag_in_progress(&self) -> Option<&CheckpointTag> {
        self.writing
            .as_ref()
            .map(|writing| &writing.tag)
            .or(self.requested.as_ref().map(|requested| &requested.tag))
    }

    /// "", "requested", or "writing".
    pub fn checkpoint_status(&self) -> &'static str {
        if self.writing.is_some() {
            "writing"
        } else if self.requested.is_some() {
            "requested"
        } else {
            ""
        }
    }

    pub fn last_completed(&self) -> Option<&CheckpointTag> {
        self.last_completed.as_ref()
    }

    /// Drop all writers; late completions are ignored.
    pub fn dispose(&mut self) {
        for stream in self.streams.values_mut() {
            stream.dispose();
        }
        self.requested = None;
        self.writing = None;
    }

    fn stream_for(&mut self, stream_id: &str) -> &mut EmittedStream {
        let io = self.io.clone();
        let max_write_batch_length = self.max_write_batch_length;
        self.streams
            .entry(stream_id.to_string())
            .or_insert_with(|| {
                debug!(stream = stream_id, "Emitted stream created");
                EmittedStream::new(stream_id, io, max_write_batch_length)
            })
    }
}

#[cfg(test)]
mod tests;
