//! Staged work-item queue.
//!
//! Every ordered work item passes through four stages: resolve-partition,
//! load-state, process-event, write-output. Items run in enqueue order and
//! a stage for one item may not begin until the previous item has completed
//! that stage, so user state always observes events in checkpoint-tag
//! order. A stage may suspend while an async read is outstanding; later
//! items keep advancing through earlier stages in the meantime.
//!
//! The queue is pure bookkeeping: the projection asks for the next runnable
//! (item, stage) pair, executes the stage against its own components, and
//! reports completion or suspension back.

use std::collections::VecDeque;

use crate::handler::ProcessingOutcome;
use crate::messages::ProjectionEvent;
use crate::tag::{CheckpointTag, TagError};

/// Stage indices.
pub const STAGE_RESOLVE_PARTITION: u8 = 0;
pub const STAGE_LOAD_STATE: u8 = 1;
pub const STAGE_PROCESS_EVENT: u8 = 2;
pub const STAGE_WRITE_OUTPUT: u8 = 3;

const STAGE_COUNT: u8 = 4;

/// An input event moving through the pipeline.
#[derive(Debug)]
pub struct ProcessEventItem {
    pub event: ProjectionEvent,
    /// Resolved at [`STAGE_RESOLVE_PARTITION`].
    pub partition: Option<String>,
    /// Produced at [`STAGE_PROCESS_EVENT`].
    pub outcome: Option<ProcessingOutcome>,
}

/// An ordered unit of work.
#[derive(Debug)]
pub enum WorkItem {
    ProcessEvent(Box<ProcessEventItem>),
    /// A checkpoint suggestion, ordered behind the events it covers.
    EmitCheckpoint { tag: CheckpointTag },
    /// A progress report, ordered behind the events it trails.
    ProgressUpdate { progress: f32 },
}

impl WorkItem {
    /// The first stage this item actually runs; single-action items join at
    /// the write stage so the ordering barrier still applies.
    fn first_stage(&self) -> u8 {
        match self {
            WorkItem::ProcessEvent(_) => STAGE_RESOLVE_PARTITION,
            WorkItem::EmitCheckpoint { .. } | WorkItem::ProgressUpdate { .. } => {
                STAGE_WRITE_OUTPUT
            }
        }
    }

    fn tag(&self) -> Option<&CheckpointTag> {
        match self {
            WorkItem::ProcessEvent(item) => Some(&item.event.tag),
            WorkItem::EmitCheckpoint { tag } => Some(tag),
            WorkItem::ProgressUpdate { .. } => None,
        }
    }
}

#[derive(Debug)]
struct Entry {
    id: u64,
    /// Next stage to run; `STAGE_COUNT` once complete.
    stage: u8,
    /// Suspended awaiting an async completion.
    busy: bool,
    item: WorkItem,
}

/// The ordered pipeline.
#[derive(Debug, Default)]
pub struct StagedQueue {
    entries: VecDeque<Entry>,
    next_id: u64,
    last_tag: Option<CheckpointTag>,
}

impl StagedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an item at the back. Tagged items must not regress behind the
    /// newest tagged item already enqueued.
    pub fn enqueue(&mut self, item: WorkItem) -> Result<u64, TagError> {
        if let (Some(last), Some(tag)) = (&self.last_tag, item.tag()) {
            if tag.try_cmp(last)? == std::cmp::Ordering::Less {
                return Err(TagError::Incompatible {
                    left: tag.to_string(),
                    right: format!("enqueued behind {last}"),
                });
            }
        }
        if let Some(tag) = item.tag() {
            self.last_tag = Some(tag.clone());
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(Entry {
            id,
            stage: item.first_stage(),
            busy: false,
            item,
        });
        Ok(id)
    }

    /// The next (item, stage) allowed to run, if any.
    ///
    /// An item may run its next stage when it is not suspended and the item
    /// ahead of it has already completed that stage.
    pub fn next_runnable(&self) -> Option<(u64, u8)> {
        let mut previous_stage = STAGE_COUNT;
        for entry in &self.entries {
            if !entry.busy && entry.stage < STAGE_COUNT && entry.stage < previous_stage {
                return Some((entry.id, entry.stage));
            }
            previous_stage = entry.stage;
        }
        None
    }

    /// Mutable access to an item's payload while running one of its stages.
    pub fn item_mut(&mut self, id: u64) -> Option<&mut WorkItem> {
        self.entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .map(|entry| &mut entry.item)
    }

    /// Record that the item's current stage finished; completed items are
    /// retired from the front. Returns the retired items in order.
    pub fn complete_stage(&mut self, id: u64) -> Vec<WorkItem> {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == id) {
            entry.busy = false;
            entry.stage += 1;
        }
        let mut retired = Vec::new();
        while let Some(front) = self.entries.front() {
            if front.stage < STAGE_COUNT {
                break;
            }
            if let Some(front) = self.entries.pop_front() {
                retired.push(front.item);
            }
        }
        retired
    }

    /// Mark the item's current stage as suspended on an async completion.
    pub fn suspend(&mut self, id: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == id) {
            entry.busy = true;
        }
    }

    /// Clear a suspension after its completion arrived. Returns false for
    /// unknown ids (stale completions after a restart).
    pub fn resume(&mut self, id: u64) -> bool {
        match self.entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.busy = false;
                true
            }
            None => false,
        }
    }

    /// Input events not yet fully written out; drives backpressure and
    /// checkpoint deferral.
    pub fn pending_events(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.item, WorkItem::ProcessEvent(_)))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all queued work (restart path).
    pub fn reset(&mut self) {
        self.entries.clear();
        self.last_tag = None;
    }
}
