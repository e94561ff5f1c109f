use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::*;

fn new_event(event_type: &str, data: &str) -> NewEvent {
    NewEvent {
        event_id: Uuid::new_v4(),
        event_type: event_type.to_string(),
        data: data.to_string(),
        metadata: String::new(),
    }
}

#[tokio::test]
async fn test_append_and_read_backward() {
    let log = InMemoryLog::new();
    let completed = log
        .write_events(
            "ledger-1",
            NO_STREAM,
            vec![new_event("Posted", "a"), new_event("Posted", "b")],
        )
        .await;
    assert_eq!(completed.result, WriteResult::Success);
    assert_eq!(completed.first_event_number, 0);

    let read = log.read_stream_backward("ledger-1", FROM_END, 10).await;
    assert_eq!(read.result, ReadResult::Success);
    assert_eq!(read.last_event_number, 1);
    assert_eq!(read.events.len(), 2);
    // Newest first.
    assert_eq!(read.events[0].event_number, 1);
    assert_eq!(read.events[1].event_number, 0);
    assert!(read.next_event_number < 0);
}

#[tokio::test]
async fn test_read_backward_pages() {
    let log = InMemoryLog::new();
    let events: Vec<NewEvent> = (0..5).map(|i| new_event("Posted", &i.to_string())).collect();
    log.write_events("ledger-1", NO_STREAM, events).await;

    let page = log.read_stream_backward("ledger-1", FROM_END, 2).await;
    assert_eq!(page.events[0].event_number, 4);
    assert_eq!(page.events[1].event_number, 3);
    assert_eq!(page.next_event_number, 2);

    let page = log
        .read_stream_backward("ledger-1", page.next_event_number, 2)
        .await;
    assert_eq!(page.events[0].event_number, 2);
    assert_eq!(page.events[1].event_number, 1);
}

#[tokio::test]
async fn test_read_missing_stream() {
    let log = InMemoryLog::new();
    let read = log.read_stream_backward("missing", FROM_END, 10).await;
    assert_eq!(read.result, ReadResult::NoStream);
    assert!(read.events.is_empty());
}

#[tokio::test]
async fn test_wrong_expected_version_rejected() {
    let log = InMemoryLog::new();
    log.write_events("ledger-1", NO_STREAM, vec![new_event("Posted", "a")])
        .await;

    let completed = log
        .write_events("ledger-1", NO_STREAM, vec![new_event("Posted", "b")])
        .await;
    assert_eq!(completed.result, WriteResult::WrongExpectedVersion);

    let completed = log
        .write_events("ledger-1", 0, vec![new_event("Posted", "b")])
        .await;
    assert_eq!(completed.result, WriteResult::Success);
    assert_eq!(completed.first_event_number, 1);
}

#[tokio::test]
async fn test_subscription_catches_up_then_tails() {
    let log = InMemoryLog::new();
    log.write_events("ledger-1", NO_STREAM, vec![new_event("Posted", "a")])
        .await;

    let mut stream = log
        .subscribe_from(SubscribePosition::Log(LogPosition::START), EventFilter::all())
        .await;

    let first = stream.next().await.expect("catch-up event");
    let SourceRecord::Event(first) = first else {
        panic!("expected event, got {first:?}");
    };
    assert_eq!(first.event.data, "a");

    log.write_events("ledger-1", 0, vec![new_event("Posted", "b")])
        .await;
    let second = stream.next().await.expect("live event");
    let SourceRecord::Event(second) = second else {
        panic!("expected event, got {second:?}");
    };
    assert_eq!(second.event.data, "b");
    assert!(second.position.commit > first.position.commit);
}

#[tokio::test]
async fn test_bounded_subscription_signals_eof() {
    let log = InMemoryLog::bounded();
    log.write_events("ledger-1", NO_STREAM, vec![new_event("Posted", "a")])
        .await;

    let mut stream = log
        .subscribe_from(SubscribePosition::Log(LogPosition::START), EventFilter::all())
        .await;
    assert!(matches!(stream.next().await, Some(SourceRecord::Event(_))));
    assert!(matches!(stream.next().await, Some(SourceRecord::Eof)));
}

#[tokio::test]
async fn test_stream_positioned_subscription_skips_other_streams() {
    let log = InMemoryLog::new();
    log.write_events("ledger-1", NO_STREAM, vec![new_event("Posted", "a")])
        .await;
    log.write_events("other-1", NO_STREAM, vec![new_event("Posted", "x")])
        .await;
    log.write_events("ledger-1", 0, vec![new_event("Posted", "b")])
        .await;

    let position = SubscribePosition::Streams([("ledger-1".to_string(), 0)].into_iter().collect());
    let mut stream = log.subscribe_from(position, EventFilter::all()).await;
    let record = stream.next().await.expect("event after position");
    let SourceRecord::Event(record) = record else {
        panic!("expected event");
    };
    assert_eq!(record.event.stream_id, "ledger-1");
    assert_eq!(record.event.event_number, 1);
}

#[tokio::test]
async fn test_dispatcher_round_trip_and_cancellation() {
    let log: Arc<dyn EventLog> = Arc::new(InMemoryLog::new());
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    spawn_dispatcher(Arc::clone(&log), request_rx, reply_tx);

    let io = ProjectionIo::new(request_tx);
    let id = io.write(
        IoRoute::CheckpointWrite,
        "checkpoints",
        NO_STREAM,
        vec![new_event("ProjectionCheckpoint", "{}")],
    );
    assert_eq!(io.outstanding_count(), 1);

    let completed = reply_rx.recv().await.expect("reply");
    assert_eq!(completed.correlation_id, id);
    assert_eq!(completed.route, IoRoute::CheckpointWrite);
    assert!(io.take(completed.correlation_id));
    // Consumed once; a duplicate delivery would be dropped.
    assert!(!io.take(completed.correlation_id));

    let cancelled = io.read_backward(IoRoute::CheckpointLoad, "checkpoints", FROM_END, 10);
    io.cancel_all();
    let late = reply_rx.recv().await.expect("late reply");
    assert_eq!(late.correlation_id, cancelled);
    assert!(!io.take(late.correlation_id), "cancelled replies are stale");
}
