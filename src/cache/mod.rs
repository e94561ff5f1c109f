//! Partition state cache with checkpoint-tag locks.
//!
//! State cached under a partition is the handler's state after folding every
//! event up to the entry's caused-by tag. A lock records the tag at which
//! in-flight work last touched the entry; locked entries must survive until
//! a checkpoint at or past that tag completes, so eviction only happens to
//! unlocked entries and `unlock` runs strictly after checkpoint completion.

use std::collections::HashMap;

use tracing::trace;

use crate::tag::{CheckpointTag, TagError};

/// The root partition key for global projections.
pub const ROOT_PARTITION: &str = "";

/// A partition's cached state.
#[derive(Debug, Clone)]
pub struct PartitionState {
    /// Opaque handler state blob.
    pub data: String,
    /// Tag of the last event folded into `data`.
    pub caused_by: CheckpointTag,
}

impl PartitionState {
    pub fn new(data: impl Into<String>, caused_by: CheckpointTag) -> Self {
        Self {
            data: data.into(),
            caused_by,
        }
    }
}

/// Outcome of a lock attempt.
#[derive(Debug)]
pub enum TryLock<'a> {
    /// Locked; state returned.
    Locked(&'a PartitionState),
    /// Nothing cached; the caller must load the partition.
    NotCached,
    /// A conflicting lock exists at a different tag. Invariant violation.
    Conflict { held_at: CheckpointTag },
}

#[derive(Debug)]
struct Entry {
    state: PartitionState,
    /// Tag at which the current hold was acquired; `None` when unlocked.
    lock_at: Option<CheckpointTag>,
}

/// In-memory map from partition key to state, with tag-based locks.
///
/// The root partition is always cached and implicitly locked; it is never
/// evicted.
#[derive(Debug, Default)]
pub struct PartitionStateCache {
    entries: HashMap<String, Entry>,
    max_cached: usize,
}

impl PartitionStateCache {
    pub fn new(max_cached: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_cached,
        }
    }

    /// State for `partition` if it is currently held (the root is always
    /// held).
    pub fn get_locked(&self, partition: &str) -> Option<&PartitionState> {
        let entry = self.entries.get(partition)?;
        if partition == ROOT_PARTITION || entry.lock_at.is_some() {
            Some(&entry.state)
        } else {
            None
        }
    }

    /// State for `partition` regardless of lock status. Management reads
    /// only; never extends a hold.
    pub fn peek(&self, partition: &str) -> Option<&PartitionState> {
        self.entries.get(partition).map(|entry| &entry.state)
    }

    /// Acquire a hold on `partition` at `at_tag`.
    ///
    /// Re-acquiring at the tag of an existing hold is idempotent when
    /// `allow_relock_same_position` is set; any other conflicting hold is
    /// reported for the caller to fault on.
    pub fn try_lock_at(
        &mut self,
        partition: &str,
        at_tag: &CheckpointTag,
        allow_relock_same_position: bool,
    ) -> Result<TryLock<'_>, TagError> {
        let Some(entry) = self.entries.get_mut(partition) else {
            return Ok(TryLock::NotCached);
        };
        if partition != ROOT_PARTITION {
            if let Some(held_at) = &entry.lock_at {
                match held_at.try_cmp(at_tag)? {
                    // Successive events advance the hold.
                    std::cmp::Ordering::Less => {}
                    std::cmp::Ordering::Equal if allow_relock_same_position => {}
                    _ => {
                        return Ok(TryLock::Conflict {
                            held_at: held_at.clone(),
                        });
                    }
                }
            }
        }
        entry.lock_at = Some(at_tag.clone());
        trace!(partition, tag = %at_tag, "Partition locked");
        Ok(TryLock::Locked(&entry.state))
    }

    /// Store `state` and hold it at `lock_at` (or leave it unlocked).
    pub fn cache_and_lock(
        &mut self,
        partition: &str,
        state: PartitionState,
        lock_at: Option<CheckpointTag>,
    ) {
        self.entries
            .insert(partition.to_string(), Entry { state, lock_at });
    }

    /// Release all holds acquired at or before `up_to_tag`, then trim
    /// unlocked entries beyond capacity.
    ///
    /// Called after a checkpoint completes at `up_to_tag`, never earlier.
    pub fn unlock(&mut self, up_to_tag: &CheckpointTag) -> Result<(), TagError> {
        for (partition, entry) in &mut self.entries {
            if partition == ROOT_PARTITION {
                continue;
            }
            if let Some(lock_at) = &entry.lock_at {
                if lock_at.is_at_or_before(up_to_tag)? {
                    trace!(partition, tag = %lock_at, "Partition unlocked");
                    entry.lock_at = None;
                }
            }
        }
        self.trim();
        Ok(())
    }

    /// Number of cached partitions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Partitions currently holding a lock (root excluded).
    pub fn locked_partitions(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(partition, entry)| {
                partition.as_str() != ROOT_PARTITION && entry.lock_at.is_some()
            })
            .map(|(partition, _)| partition.clone())
            .collect()
    }

    fn trim(&mut self) {
        if self.entries.len() <= self.max_cached {
            return;
        }
        let mut evictable: Vec<String> = self
            .entries
            .iter()
            .filter(|(partition, entry)| {
                partition.as_str() != ROOT_PARTITION && entry.lock_at.is_none()
            })
            .map(|(partition, _)| partition.clone())
            .collect();
        // Deterministic eviction order; cache capacity is a soft bound.
        evictable.sort();
        for partition in evictable {
            if self.entries.len() <= self.max_cached {
                break;
            }
            trace!(partition, "Partition evicted");
            self.entries.remove(&partition);
        }
    }
}
