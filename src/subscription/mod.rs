//! Projection subscription: turns raw committed events into ordered,
//! tagged projection input.
//!
//! For every source record the subscription computes a candidate checkpoint
//! tag, rejects replays (candidate at or before the last delivered tag),
//! applies the event filter, and stamps each outgoing message with a
//! subscription id and a dense sequence number. It also accounts for
//! unhandled input and suggests checkpoints so a projection ignoring most
//! of the log still makes durable progress.

use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::ProjectionConfig;
use crate::filter::EventFilter;
use crate::messages::{ProjectionEvent, SequencedMessage, SubscriptionMessage};
use crate::store::{CommittedEvent, SourceRecord};
use crate::tag::{CheckpointTag, PositionTagger, TagError};

/// Minimum progress change worth reporting.
const PROGRESS_STEP: f32 = 0.1;

/// One subscription incarnation.
///
/// A restart creates a fresh subscription with a new id; messages from the
/// old incarnation are dropped by the projection on id mismatch.
pub struct ProjectionSubscription {
    id: Uuid,
    tagger: PositionTagger,
    filter: EventFilter,
    last_tag: CheckpointTag,
    sequence: u64,
    stop_on_eof: bool,
    eof_sent: bool,
    checkpoint_handled_threshold: i64,
    checkpoint_unhandled_bytes_threshold: i64,
    handled_since_suggestion: i64,
    unhandled_bytes: i64,
    /// Prepare position of the last tagged event, for byte accounting on
    /// whole-log sources.
    last_accounted_position: Option<i64>,
    last_progress: f32,
}

impl ProjectionSubscription {
    pub fn new(
        id: Uuid,
        tagger: PositionTagger,
        filter: EventFilter,
        from: CheckpointTag,
        config: &ProjectionConfig,
    ) -> Self {
        debug!(subscription_id = %id, from = %from, "Subscription created");
        Self {
            id,
            last_accounted_position: from.prepare_position(),
            tagger,
            filter,
            last_tag: from,
            sequence: 0,
            stop_on_eof: config.stop_on_eof,
            eof_sent: false,
            checkpoint_handled_threshold: config.checkpoint_handled_threshold,
            checkpoint_unhandled_bytes_threshold: config.checkpoint_unhandled_bytes_threshold,
            handled_since_suggestion: 0,
            unhandled_bytes: 0,
            last_progress: 0.0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The tag of the last delivered or suggested position.
    pub fn last_tag(&self) -> &CheckpointTag {
        &self.last_tag
    }

    /// Process one source record into zero or more sequenced messages.
    pub fn process(&mut self, record: SourceRecord) -> Result<Vec<SequencedMessage>, TagError> {
        match record {
            SourceRecord::Event(event) => self.process_event(event),
            SourceRecord::Eof => Ok(self.process_eof()),
        }
    }

    fn process_event(
        &mut self,
        event: CommittedEvent,
    ) -> Result<Vec<SequencedMessage>, TagError> {
        let mut messages = Vec::new();

        if (event.progress - self.last_progress).abs() >= PROGRESS_STEP {
            self.last_progress = event.progress;
            messages.push(self.stamp(SubscriptionMessage::ProgressChanged {
                progress: event.progress,
            }));
        }

        let Some(candidate) = self.tagger.tag_for(&self.last_tag, &event) else {
            // Untracked stream; cannot advance the position, but the bytes
            // still count toward checkpoint pressure on whole-log sources.
            trace!(stream = %event.event.stream_id, "Untracked stream skipped");
            return Ok(messages);
        };

        if candidate.is_at_or_before(&self.last_tag)? {
            trace!(tag = %candidate, last = %self.last_tag, "Replayed event rejected");
            return Ok(messages);
        }

        let passes = self
            .filter
            .passes(&event.event.stream_id, &event.event.event_type);
        let unhandled_delta = self.bytes_since_accounted(&candidate);
        self.account_position(&candidate);

        if passes {
            self.last_tag = candidate.clone();
            self.handled_since_suggestion += 1;
            self.unhandled_bytes = 0;
            messages.push(self.stamp(SubscriptionMessage::EventReceived(ProjectionEvent {
                tag: candidate.clone(),
                stream_id: event.event.stream_id,
                event_number: event.event.event_number,
                event_id: event.event.event_id,
                event_type: event.event.event_type,
                data: event.event.data,
                metadata: event.event.metadata,
            })));
            if self.handled_since_suggestion >= self.checkpoint_handled_threshold {
                debug!(tag = %candidate, "Checkpoint suggested: handled threshold");
                self.reset_pressure();
                messages.push(
                    self.stamp(SubscriptionMessage::CheckpointSuggested { tag: candidate }),
                );
            }
        } else {
            self.unhandled_bytes += unhandled_delta;
            if self.unhandled_bytes > self.checkpoint_unhandled_bytes_threshold {
                // Advance past the unhandled region so the next run does not
                // rescan it.
                debug!(tag = %candidate, bytes = self.unhandled_bytes, "Checkpoint suggested: unhandled bytes");
                self.last_tag = candidate.clone();
                self.reset_pressure();
                messages.push(
                    self.stamp(SubscriptionMessage::CheckpointSuggested { tag: candidate }),
                );
            }
        }

        Ok(messages)
    }

    fn process_eof(&mut self) -> Vec<SequencedMessage> {
        let mut messages = Vec::new();
        if self.last_progress < 100.0 {
            self.last_progress = 100.0;
            messages.push(self.stamp(SubscriptionMessage::ProgressChanged { progress: 100.0 }));
        }
        if self.stop_on_eof && !self.eof_sent {
            self.eof_sent = true;
            debug!(subscription_id = %self.id, "EOF reached");
            messages.push(self.stamp(SubscriptionMessage::EofReached));
        }
        messages
    }

    fn stamp(&mut self, payload: SubscriptionMessage) -> SequencedMessage {
        self.sequence += 1;
        SequencedMessage {
            subscription_id: self.id,
            sequence: self.sequence,
            payload,
        }
    }

    fn account_position(&mut self, tag: &CheckpointTag) {
        if let Some(prepare) = tag.prepare_position() {
            self.last_accounted_position = Some(prepare);
        }
    }

    /// Position distance since the previous tagged event. Sources without
    /// byte positions weigh every event as one byte.
    fn bytes_since_accounted(&self, tag: &CheckpointTag) -> i64 {
        match (tag.prepare_position(), self.last_accounted_position) {
            (Some(prepare), Some(accounted)) => (prepare - accounted).max(1),
            _ => 1,
        }
    }

    fn reset_pressure(&mut self) {
        self.handled_since_suggestion = 0;
        self.unhandled_bytes = 0;
    }
}
