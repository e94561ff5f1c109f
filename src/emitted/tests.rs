use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::*;
use crate::store::{IoEnvelope, IoRequest, RecordedEvent};

fn tag(prepare: i64) -> CheckpointTag {
    CheckpointTag::Position {
        commit: prepare,
        prepare,
    }
}

struct Harness {
    stream: EmittedStream,
    requests: mpsc::UnboundedReceiver<IoEnvelope>,
}

impl Harness {
    fn new(batch_length: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            stream: EmittedStream::new("$out", ProjectionIo::new(tx), batch_length),
            requests: rx,
        }
    }

    fn next_request(&mut self) -> IoEnvelope {
        self.requests.try_recv().expect("expected a log request")
    }

    fn no_request(&mut self) {
        assert!(self.requests.try_recv().is_err(), "unexpected log request");
    }
}

fn emitted(prepare: i64, event_type: &str) -> EmittedEvent {
    EmittedEvent::new("$out", event_type, format!("data-{prepare}"), tag(prepare))
}

fn tracked(prepare: i64, event_type: &str, committed_at: &Arc<AtomicI64>) -> EmittedEvent {
    let committed_at = Arc::clone(committed_at);
    emitted(prepare, event_type).with_on_committed(Box::new(move |event_number| {
        committed_at.store(event_number, Ordering::SeqCst);
    }))
}

fn committed_event(event_number: i64, event_type: &str, tag: &CheckpointTag) -> RecordedEvent {
    RecordedEvent {
        stream_id: "$out".to_string(),
        event_number,
        event_id: Uuid::new_v4(),
        event_type: event_type.to_string(),
        data: String::new(),
        metadata: tag.to_metadata(),
    }
}

fn recovery_page(events: Vec<RecordedEvent>, last: i64, next: i64) -> BackwardReadCompleted {
    BackwardReadCompleted {
        result: ReadResult::Success,
        events,
        next_event_number: next,
        last_event_number: last,
    }
}

fn expect_write(envelope: IoEnvelope) -> (i64, Vec<NewEvent>) {
    match envelope.request {
        IoRequest::Write {
            expected_version,
            events,
            ..
        } => (expected_version, events),
        other => panic!("expected write, got {other:?}"),
    }
}

#[test]
fn test_first_emit_starts_recovery_then_writes() {
    let mut harness = Harness::new(10);
    let committed_at = Arc::new(AtomicI64::new(-42));
    harness
        .stream
        .emit(vec![tracked(110, "X", &committed_at)])
        .unwrap();

    // Recovery read issued before any write.
    let envelope = harness.next_request();
    assert!(matches!(envelope.request, IoRequest::ReadBackward { .. }));
    harness.no_request();

    // Target stream does not exist: go live and write from scratch.
    harness
        .stream
        .handle_recovery_read(BackwardReadCompleted::no_stream())
        .unwrap();
    let (expected_version, events) = expect_write(harness.next_request());
    assert_eq!(expected_version, NO_STREAM);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].metadata, tag(110).to_metadata());

    harness
        .stream
        .handle_write_completed(WriteCompleted {
            result: WriteResult::Success,
            first_event_number: 0,
        })
        .unwrap();
    assert_eq!(committed_at.load(Ordering::SeqCst), 0);
    assert_eq!(harness.stream.pending_writes(), 0);
}

#[test]
fn test_batches_respect_max_write_batch_length() {
    let mut harness = Harness::new(2);
    harness
        .stream
        .emit(vec![emitted(110, "X"), emitted(120, "X"), emitted(130, "X")])
        .unwrap();
    harness.next_request();
    harness
        .stream
        .handle_recovery_read(BackwardReadCompleted::no_stream())
        .unwrap();

    let (expected, events) = expect_write(harness.next_request());
    assert_eq!(expected, NO_STREAM);
    assert_eq!(events.len(), 2);
    // Third event waits for the in-flight batch.
    harness.no_request();

    harness
        .stream
        .handle_write_completed(WriteCompleted {
            result: WriteResult::Success,
            first_event_number: 0,
        })
        .unwrap();
    let (expected, events) = expect_write(harness.next_request());
    assert_eq!(expected, 1);
    assert_eq!(events.len(), 1);
}

#[test]
fn test_recovery_dedup_replays_without_rewriting() {
    // $out already holds emits from a previous life: #0 caused by tag 90,
    // #1 caused by tag 110. The replayed handler re-emits both.
    let mut harness = Harness::new(10);
    let first_committed = Arc::new(AtomicI64::new(-1));
    let second_committed = Arc::new(AtomicI64::new(-1));

    harness
        .stream
        .emit(vec![tracked(90, "X", &first_committed)])
        .unwrap();
    harness.next_request();
    harness
        .stream
        .handle_recovery_read(recovery_page(
            vec![
                committed_event(1, "X", &tag(110)),
                committed_event(0, "X", &tag(90)),
            ],
            1,
            -1,
        ))
        .unwrap();

    // Already committed: matched, acknowledged, not rewritten.
    assert_eq!(first_committed.load(Ordering::SeqCst), 0);
    harness.no_request();

    harness
        .stream
        .emit(vec![tracked(110, "X", &second_committed)])
        .unwrap();
    assert_eq!(second_committed.load(Ordering::SeqCst), 1);
    harness.no_request();

    // Fresh emits append after the committed tail.
    harness.stream.emit(vec![emitted(150, "X")]).unwrap();
    let (expected, events) = expect_write(harness.next_request());
    assert_eq!(expected, 1);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].metadata, tag(150).to_metadata());
}

#[test]
fn test_recovery_skips_committed_events_older_than_replay() {
    // Replay starts after tag 90; the committed emit at 90 is never
    // re-emitted and is silently discarded from the seen stack.
    let mut harness = Harness::new(10);
    let committed_at = Arc::new(AtomicI64::new(-1));

    harness
        .stream
        .emit(vec![tracked(110, "X", &committed_at)])
        .unwrap();
    harness.next_request();
    harness
        .stream
        .handle_recovery_read(recovery_page(
            vec![
                committed_event(1, "X", &tag(110)),
                committed_event(0, "X", &tag(90)),
            ],
            1,
            -1,
        ))
        .unwrap();

    assert_eq!(committed_at.load(Ordering::SeqCst), 1);
    harness.no_request();
}

#[test]
fn test_recovery_mismatch_requests_restart() {
    let mut harness = Harness::new(10);
    harness.stream.emit(vec![emitted(110, "X")]).unwrap();
    harness.next_request();

    // Committed event at the same tag has a different type: a different
    // process wrote it.
    let result = harness.stream.handle_recovery_read(recovery_page(
        vec![committed_event(0, "Y", &tag(110))],
        0,
        -1,
    ));
    assert!(matches!(result, Err(EmitFault::Restart(_))));
}

#[test]
fn test_replayed_emit_without_counterpart_requests_restart() {
    let mut harness = Harness::new(10);
    harness.stream.emit(vec![emitted(90, "X")]).unwrap();
    harness.next_request();

    // The committed tail is at tag 110 but holds nothing matching tag 90.
    let result = harness.stream.handle_recovery_read(recovery_page(
        vec![committed_event(0, "X", &tag(110))],
        0,
        -1,
    ));
    assert!(matches!(result, Err(EmitFault::Restart(_))));
}

#[test]
fn test_wrong_expected_version_requests_restart() {
    let mut harness = Harness::new(10);
    harness.stream.emit(vec![emitted(110, "X")]).unwrap();
    harness.next_request();
    harness
        .stream
        .handle_recovery_read(BackwardReadCompleted::no_stream())
        .unwrap();
    harness.next_request();

    let result = harness.stream.handle_write_completed(WriteCompleted {
        result: WriteResult::WrongExpectedVersion,
        first_event_number: -1,
    });
    assert!(matches!(result, Err(EmitFault::Restart(_))));
}

#[test]
fn test_timeouts_retry_same_batch() {
    let mut harness = Harness::new(10);
    harness.stream.emit(vec![emitted(110, "X")]).unwrap();
    harness.next_request();
    harness
        .stream
        .handle_recovery_read(BackwardReadCompleted::no_stream())
        .unwrap();
    let (first_expected, first_events) = expect_write(harness.next_request());

    harness
        .stream
        .handle_write_completed(WriteCompleted {
            result: WriteResult::CommitTimeout,
            first_event_number: -1,
        })
        .unwrap();
    let delay = harness.next_request();
    assert!(matches!(delay.request, IoRequest::Delay { .. }));

    harness.stream.handle_retry_timer().unwrap();
    let (retry_expected, retry_events) = expect_write(harness.next_request());
    assert_eq!(retry_expected, first_expected);
    assert_eq!(retry_events.len(), first_events.len());
    assert_eq!(retry_events[0].event_id, first_events[0].event_id);

    harness
        .stream
        .handle_write_completed(WriteCompleted {
            result: WriteResult::Success,
            first_event_number: 0,
        })
        .unwrap();
    assert_eq!(harness.stream.pending_writes(), 0);
}

#[test]
fn test_expected_tag_strictly_behind_requests_restart() {
    let mut harness = Harness::new(10);
    harness.stream.emit(vec![emitted(110, "X")]).unwrap();
    harness.next_request();
    harness
        .stream
        .handle_recovery_read(BackwardReadCompleted::no_stream())
        .unwrap();
    harness.next_request();

    // Equal to the last submitted tag: legal.
    harness
        .stream
        .emit(vec![emitted(120, "X").with_expected_tag(tag(110))])
        .unwrap();

    // Strictly behind: a concurrency violation.
    let result = harness
        .stream
        .emit(vec![emitted(130, "X").with_expected_tag(tag(90))]);
    assert!(matches!(result, Err(EmitFault::Restart(_))));
}

#[test]
fn test_caused_by_regression_is_fatal() {
    let mut harness = Harness::new(10);
    harness.stream.emit(vec![emitted(110, "X")]).unwrap();
    let result = harness.stream.emit(vec![emitted(90, "X")]);
    assert!(matches!(result, Err(EmitFault::Fatal(_))));
}

#[test]
fn test_pending_writes_before_gates_checkpoints() {
    let mut harness = Harness::new(1);
    harness
        .stream
        .emit(vec![emitted(110, "X"), emitted(130, "X")])
        .unwrap();
    harness.next_request();
    harness
        .stream
        .handle_recovery_read(BackwardReadCompleted::no_stream())
        .unwrap();

    // One in flight (110), one ready (130).
    assert_eq!(harness.stream.pending_writes_before(&tag(110)).unwrap(), 1);
    assert_eq!(harness.stream.pending_writes_before(&tag(130)).unwrap(), 2);

    harness.next_request();
    harness
        .stream
        .handle_write_completed(WriteCompleted {
            result: WriteResult::Success,
            first_event_number: 0,
        })
        .unwrap();
    assert_eq!(harness.stream.pending_writes_before(&tag(110)).unwrap(), 0);
    assert_eq!(harness.stream.pending_writes_before(&tag(130)).unwrap(), 1);
}

#[test]
fn test_disposed_stream_drops_late_completions() {
    let mut harness = Harness::new(10);
    let committed_at = Arc::new(AtomicI64::new(-1));
    harness
        .stream
        .emit(vec![tracked(110, "X", &committed_at)])
        .unwrap();
    harness.next_request();
    harness
        .stream
        .handle_recovery_read(BackwardReadCompleted::no_stream())
        .unwrap();
    harness.next_request();

    harness.stream.dispose();
    harness
        .stream
        .handle_write_completed(WriteCompleted {
            result: WriteResult::Success,
            first_event_number: 0,
        })
        .unwrap();
    assert_eq!(committed_at.load(Ordering::SeqCst), -1, "callback dropped");
}

#[test]
fn test_multi_page_recovery() {
    let mut harness = Harness::new(10);
    let committed_at = Arc::new(AtomicI64::new(-1));
    harness
        .stream
        .emit(vec![tracked(90, "X", &committed_at)])
        .unwrap();
    harness.next_request();

    harness
        .stream
        .handle_recovery_read(recovery_page(
            vec![committed_event(1, "X", &tag(110))],
            1,
            0,
        ))
        .unwrap();
    assert!(harness.stream.recovering());
    // Next page requested.
    let envelope = harness.next_request();
    assert!(matches!(envelope.request, IoRequest::ReadBackward { .. }));

    harness
        .stream
        .handle_recovery_read(recovery_page(
            vec![committed_event(0, "X", &tag(90))],
            1,
            -1,
        ))
        .unwrap();
    assert!(!harness.stream.recovering());
    assert_eq!(committed_at.load(Ordering::SeqCst), 0);
}
