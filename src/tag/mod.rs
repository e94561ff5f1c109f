//! Checkpoint tags and position tagging.
//!
//! A `CheckpointTag` is the totally-ordered position identifier a projection
//! uses to track progress through the event log. The `PositionTagger`
//! computes tags from delivered events; which shape of tag it produces
//! depends on what the projection reads (a single stream, a fixed set of
//! streams, or the whole log).

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::store::{CommittedEvent, LogPosition, SubscribePosition};

/// Result type for tag operations.
pub type Result<T> = std::result::Result<T, TagError>;

/// Errors from tag comparison and serialization.
#[derive(Debug, thiserror::Error)]
pub enum TagError {
    #[error("Incompatible checkpoint tags: {left} vs {right}")]
    Incompatible { left: String, right: String },

    #[error("Unparseable checkpoint tag: {0}")]
    Unparseable(#[from] serde_json::Error),
}

/// A position in the projection's input, ordered within one tagging mode.
///
/// Tags are compared structurally. Comparing tags produced by different
/// tagging modes (or for different stream sets) is an invariant violation,
/// surfaced as [`TagError::Incompatible`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckpointTag {
    /// Global log position, used when reading the whole log.
    Position { commit: i64, prepare: i64 },
    /// Event number within a single source stream.
    Stream { stream: String, seq: i64 },
    /// Per-stream event numbers for a fixed set of source streams.
    MultiStream { streams: BTreeMap<String, i64> },
}

impl CheckpointTag {
    /// Compare two tags, failing if they come from different tagging modes.
    ///
    /// Multi-stream tags are partially ordered component-wise; a mixed
    /// comparison (some components ahead, some behind) is incompatible.
    pub fn try_cmp(&self, other: &CheckpointTag) -> Result<Ordering> {
        match (self, other) {
            (
                CheckpointTag::Position { commit, prepare },
                CheckpointTag::Position {
                    commit: other_commit,
                    prepare: other_prepare,
                },
            ) => Ok((commit, prepare).cmp(&(other_commit, other_prepare))),
            (
                CheckpointTag::Stream { stream, seq },
                CheckpointTag::Stream {
                    stream: other_stream,
                    seq: other_seq,
                },
            ) if stream == other_stream => Ok(seq.cmp(other_seq)),
            (
                CheckpointTag::MultiStream { streams },
                CheckpointTag::MultiStream {
                    streams: other_streams,
                },
            ) if streams.len() == other_streams.len()
                && streams.keys().eq(other_streams.keys()) =>
            {
                let mut ordering = Ordering::Equal;
                for (stream, seq) in streams {
                    let other_seq = other_streams[stream];
                    let component = seq.cmp(&other_seq);
                    match (ordering, component) {
                        (_, Ordering::Equal) => {}
                        (Ordering::Equal, _) => ordering = component,
                        (a, b) if a == b => {}
                        _ => return Err(self.incompatible(other)),
                    }
                }
                Ok(ordering)
            }
            _ => Err(self.incompatible(other)),
        }
    }

    /// Strict "after" check; incompatible tags compare as an error.
    pub fn is_after(&self, other: &CheckpointTag) -> Result<bool> {
        Ok(self.try_cmp(other)? == Ordering::Greater)
    }

    /// "At or before" check; incompatible tags compare as an error.
    pub fn is_at_or_before(&self, other: &CheckpointTag) -> Result<bool> {
        Ok(self.try_cmp(other)? != Ordering::Greater)
    }

    /// Serialize for event metadata.
    pub fn to_metadata(&self) -> String {
        // The tag shapes serialize to plain JSON objects; this cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse from event metadata.
    pub fn from_metadata(metadata: &str) -> Result<CheckpointTag> {
        Ok(serde_json::from_str(metadata)?)
    }

    /// The position to resume a subscription from.
    pub fn subscribe_position(&self) -> SubscribePosition {
        match self {
            CheckpointTag::Position { commit, prepare } => {
                SubscribePosition::Log(LogPosition {
                    commit: *commit,
                    prepare: *prepare,
                })
            }
            CheckpointTag::Stream { stream, seq } => {
                let mut streams = BTreeMap::new();
                streams.insert(stream.clone(), *seq);
                SubscribePosition::Streams(streams)
            }
            CheckpointTag::MultiStream { streams } => {
                SubscribePosition::Streams(streams.clone())
            }
        }
    }

    /// The prepare position, where the tag carries one.
    ///
    /// Used for unhandled-byte accounting; stream-mode tags have no byte
    /// positions and return `None`.
    pub fn prepare_position(&self) -> Option<i64> {
        match self {
            CheckpointTag::Position { prepare, .. } => Some(*prepare),
            _ => None,
        }
    }

    fn incompatible(&self, other: &CheckpointTag) -> TagError {
        TagError::Incompatible {
            left: self.to_string(),
            right: other.to_string(),
        }
    }
}

impl PartialOrd for CheckpointTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.try_cmp(other).ok()
    }
}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointTag::Position { commit, prepare } => {
                write!(f, "C:{commit}/P:{prepare}")
            }
            CheckpointTag::Stream { stream, seq } => write!(f, "{stream}:{seq}"),
            CheckpointTag::MultiStream { streams } => {
                let parts: Vec<String> =
                    streams.iter().map(|(s, n)| format!("{s}:{n}")).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

/// Computes checkpoint tags for delivered events.
///
/// The variant is chosen when the projection's source definition is built:
/// single-stream sources tag by event number, fixed stream sets tag by a
/// per-stream vector, and whole-log sources tag by (commit, prepare).
#[derive(Debug, Clone)]
pub enum PositionTagger {
    /// Whole-log source; tags are global positions.
    TransactionLog,
    /// Single source stream; tags are event numbers.
    SingleStream(String),
    /// Fixed set of source streams; tags are per-stream vectors.
    MultiStream(Vec<String>),
}

impl PositionTagger {
    /// The tag a projection starts from when no checkpoint exists.
    pub fn zero_tag(&self) -> CheckpointTag {
        match self {
            PositionTagger::TransactionLog => CheckpointTag::Position {
                commit: 0,
                prepare: -1,
            },
            PositionTagger::SingleStream(stream) => CheckpointTag::Stream {
                stream: stream.clone(),
                seq: -1,
            },
            PositionTagger::MultiStream(streams) => CheckpointTag::MultiStream {
                streams: streams.iter().map(|s| (s.clone(), -1)).collect(),
            },
        }
    }

    /// Compute the tag for a delivered event, given the previous tag.
    ///
    /// Returns `None` for events this tagger does not track (an event from a
    /// stream outside a single/multi-stream source). Such events cannot
    /// advance the projection's position.
    pub fn tag_for(
        &self,
        previous: &CheckpointTag,
        event: &CommittedEvent,
    ) -> Option<CheckpointTag> {
        match self {
            PositionTagger::TransactionLog => Some(CheckpointTag::Position {
                commit: event.position.commit,
                prepare: event.position.prepare,
            }),
            PositionTagger::SingleStream(stream) => {
                if event.event.stream_id != *stream {
                    return None;
                }
                Some(CheckpointTag::Stream {
                    stream: stream.clone(),
                    seq: event.event.event_number,
                })
            }
            PositionTagger::MultiStream(tracked) => {
                if !tracked.contains(&event.event.stream_id) {
                    return None;
                }
                let mut streams = match previous {
                    CheckpointTag::MultiStream { streams } => streams.clone(),
                    // A previous tag of another shape means the caller mixed
                    // taggers; start from zero rather than guess.
                    _ => tracked.iter().map(|s| (s.clone(), -1)).collect(),
                };
                streams.insert(event.event.stream_id.clone(), event.event.event_number);
                Some(CheckpointTag::MultiStream { streams })
            }
        }
    }

    /// Whether a persisted tag was produced by this tagging mode.
    pub fn is_compatible(&self, tag: &CheckpointTag) -> bool {
        match (self, tag) {
            (PositionTagger::TransactionLog, CheckpointTag::Position { .. }) => true,
            (PositionTagger::SingleStream(stream), CheckpointTag::Stream { stream: s, .. }) => {
                stream == s
            }
            (PositionTagger::MultiStream(tracked), CheckpointTag::MultiStream { streams }) => {
                tracked.len() == streams.len()
                    && tracked.iter().all(|s| streams.contains_key(s))
            }
            _ => false,
        }
    }
}
