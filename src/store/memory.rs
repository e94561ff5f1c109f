//! In-memory event log for tests and embedded use.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::filter::EventFilter;

use super::{
    BackwardReadCompleted, CommittedEvent, EventLog, LogPosition, NewEvent, ReadResult,
    RecordedEvent, SourceRecord, SubscribePosition, WriteCompleted, WriteResult, NO_STREAM,
};

use async_trait::async_trait;

/// Broadcast capacity for live subscriptions.
const LIVE_CAPACITY: usize = 1024;

/// Buffer between the log and each subscriber; fills up when the consumer
/// pauses, blocking the forwarding task (backpressure).
const SUBSCRIBER_BUFFER: usize = 64;

/// Gap between consecutive global positions, so position deltas resemble
/// byte distances.
const POSITION_STRIDE: i64 = 100;

#[derive(Default)]
struct LogState {
    /// All events in commit order.
    log: Vec<CommittedEvent>,
    /// Per-stream indexes into `log`.
    streams: std::collections::HashMap<String, Vec<usize>>,
    next_position: i64,
}

/// An in-memory event log.
///
/// Supports optimistic appends, backward reads, and live subscriptions.
/// `bounded()` logs additionally deliver [`SourceRecord::Eof`] once a
/// subscriber has caught up with the events present at subscribe time.
pub struct InMemoryLog {
    state: Arc<RwLock<LogState>>,
    live: broadcast::Sender<CommittedEvent>,
    bounded: bool,
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLog {
    /// A log whose subscriptions tail live writes indefinitely.
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(LogState::default())),
            live,
            bounded: false,
        }
    }

    /// A log whose subscriptions signal EOF after the catch-up phase.
    pub fn bounded() -> Self {
        Self {
            bounded: true,
            ..Self::new()
        }
    }

    /// All events appended to `stream`, in stream order.
    pub async fn stream_events(&self, stream: &str) -> Vec<RecordedEvent> {
        let state = self.state.read().await;
        state
            .streams
            .get(stream)
            .map(|indexes| {
                indexes
                    .iter()
                    .map(|&i| state.log[i].event.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Global commit positions of every event in `stream`, in stream order.
    pub async fn stream_positions(&self, stream: &str) -> Vec<i64> {
        let state = self.state.read().await;
        state
            .streams
            .get(stream)
            .map(|indexes| {
                indexes
                    .iter()
                    .map(|&i| state.log[i].position.commit)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventLog for InMemoryLog {
    async fn read_stream_backward(
        &self,
        stream: &str,
        from: i64,
        max_count: usize,
    ) -> BackwardReadCompleted {
        let state = self.state.read().await;
        let Some(indexes) = state.streams.get(stream) else {
            return BackwardReadCompleted::no_stream();
        };
        let head = indexes.len() as i64 - 1;
        let start = if from < 0 { head } else { from.min(head) };
        let mut events = Vec::new();
        let mut n = start;
        while n >= 0 && events.len() < max_count {
            events.push(state.log[indexes[n as usize]].event.clone());
            n -= 1;
        }
        BackwardReadCompleted {
            result: ReadResult::Success,
            events,
            next_event_number: n,
            last_event_number: head,
        }
    }

    async fn write_events(
        &self,
        stream: &str,
        expected_version: i64,
        events: Vec<NewEvent>,
    ) -> WriteCompleted {
        let mut state = self.state.write().await;
        let current = state
            .streams
            .get(stream)
            .map(|indexes| indexes.len() as i64 - 1)
            .unwrap_or(NO_STREAM);
        if expected_version != current {
            debug!(
                stream,
                expected = expected_version,
                current,
                "Append rejected: wrong expected version"
            );
            return WriteCompleted {
                result: WriteResult::WrongExpectedVersion,
                first_event_number: current,
            };
        }

        let first_event_number = current + 1;
        let mut committed = Vec::new();
        for (offset, event) in events.into_iter().enumerate() {
            state.next_position += POSITION_STRIDE;
            let position = state.next_position;
            let index = state.log.len();
            let record = CommittedEvent {
                event: RecordedEvent {
                    stream_id: stream.to_string(),
                    event_number: first_event_number + offset as i64,
                    event_id: event.event_id,
                    event_type: event.event_type,
                    data: event.data,
                    metadata: event.metadata,
                },
                position: LogPosition {
                    commit: position,
                    prepare: position,
                },
                progress: 100.0,
            };
            state.log.push(record.clone());
            state.streams.entry(stream.to_string()).or_default().push(index);
            committed.push(record);
        }
        drop(state);

        for record in committed {
            // No receivers is fine; subscriptions may come and go.
            let _ = self.live.send(record);
        }

        WriteCompleted {
            result: WriteResult::Success,
            first_event_number,
        }
    }

    async fn subscribe_from(
        &self,
        position: SubscribePosition,
        filter: EventFilter,
    ) -> ReceiverStream<SourceRecord> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        // Subscribe to live before snapshotting so nothing is missed; the
        // position check deduplicates the overlap.
        let mut live = self.live.subscribe();
        let state = Arc::clone(&self.state);
        let bounded = self.bounded;

        tokio::spawn(async move {
            let snapshot: Vec<CommittedEvent> = {
                let state = state.read().await;
                state.log.clone()
            };
            let total = snapshot.len().max(1) as f32;
            let mut last_commit = -1;
            let mut delivered = 0usize;

            for record in snapshot {
                if !passes(&record, &position, &filter) {
                    continue;
                }
                last_commit = record.position.commit;
                delivered += 1;
                let mut record = record;
                record.progress = (delivered as f32 / total) * 100.0;
                if tx.send(SourceRecord::Event(record)).await.is_err() {
                    return;
                }
            }

            if bounded && tx.send(SourceRecord::Eof).await.is_err() {
                return;
            }

            loop {
                match live.recv().await {
                    Ok(record) => {
                        if record.position.commit <= last_commit
                            || !passes(&record, &position, &filter)
                        {
                            continue;
                        }
                        last_commit = record.position.commit;
                        if tx.send(SourceRecord::Event(record)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "In-memory subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        ReceiverStream::new(rx)
    }
}

fn passes(record: &CommittedEvent, position: &SubscribePosition, filter: &EventFilter) -> bool {
    let after_position = match position {
        SubscribePosition::Log(log) => record.position.commit > log.commit,
        SubscribePosition::Streams(streams) => match streams.get(&record.event.stream_id) {
            Some(&seq) => record.event.event_number > seq,
            // Stream-positioned subscriptions only deliver tracked streams.
            None => false,
        },
    };
    after_position && filter.passes_source(&record.event.stream_id)
}
