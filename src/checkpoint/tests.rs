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
    manager: CheckpointManager,
    requests: mpsc::UnboundedReceiver<IoEnvelope>,
}

impl Harness {
    fn new(strategy: WriteStrategy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = CheckpointManager::new(
            StreamNames::new("totals"),
            ProjectionIo::new(tx),
            strategy,
            true,
            500,
        );
        Self {
            manager,
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

fn checkpoint_event(event_number: i64, tag: &CheckpointTag, state: &str) -> RecordedEvent {
    RecordedEvent {
        stream_id: "$projections-totals-checkpoint".to_string(),
        event_number,
        event_id: Uuid::new_v4(),
        event_type: CHECKPOINT_EVENT_TYPE.to_string(),
        data: state.to_string(),
        metadata: tag.to_metadata(),
    }
}

fn success_page(events: Vec<RecordedEvent>, last: i64, next: i64) -> BackwardReadCompleted {
    BackwardReadCompleted {
        result: ReadResult::Success,
        events,
        next_event_number: next,
        last_event_number: last,
    }
}

#[test]
fn test_load_empty_checkpoint_stream() {
    let mut harness = Harness::new(WriteStrategy::Default);
    harness.manager.begin_load();
    let envelope = harness.next_request();
    match envelope.request {
        IoRequest::ReadBackward { stream, max_count, .. } => {
            assert_eq!(stream, "$projections-totals-checkpoint");
            assert_eq!(max_count, 10);
        }
        other => panic!("expected read, got {other:?}"),
    }

    let loaded = harness
        .manager
        .handle_load_read(BackwardReadCompleted::no_stream())
        .unwrap()
        .expect("load complete");
    assert!(loaded.tag.is_none());
    assert_eq!(loaded.state, "");
}

#[test]
fn test_load_finds_most_recent_checkpoint() {
    let mut harness = Harness::new(WriteStrategy::Default);
    harness.manager.begin_load();
    harness.next_request();

    let loaded = harness
        .manager
        .handle_load_read(success_page(
            vec![checkpoint_event(3, &tag(300), "{\"sum\":3}")],
            3,
            2,
        ))
        .unwrap()
        .expect("load complete");
    assert_eq!(loaded.tag, Some(tag(300)));
    assert_eq!(loaded.state, "{\"sum\":3}");
}

#[test]
fn test_load_pages_past_foreign_events() {
    let mut harness = Harness::new(WriteStrategy::Default);
    harness.manager.begin_load();
    harness.next_request();

    // First page holds no checkpoint event; the manager pages on.
    let foreign = RecordedEvent {
        stream_id: "$projections-totals-checkpoint".to_string(),
        event_number: 5,
        event_id: Uuid::new_v4(),
        event_type: "SomethingElse".to_string(),
        data: String::new(),
        metadata: String::new(),
    };
    let outcome = harness
        .manager
        .handle_load_read(success_page(vec![foreign], 5, 4))
        .unwrap();
    assert!(outcome.is_none());
    harness.next_request();

    let loaded = harness
        .manager
        .handle_load_read(success_page(
            vec![checkpoint_event(4, &tag(200), "state")],
            5,
            3,
        ))
        .unwrap()
        .expect("load complete");
    assert_eq!(loaded.tag, Some(tag(200)));
}

#[test]
fn test_checkpoint_writes_when_no_emits_pending() {
    let mut harness = Harness::new(WriteStrategy::Default);
    harness.manager.begin_load();
    harness.next_request();
    harness
        .manager
        .handle_load_read(BackwardReadCompleted::no_stream())
        .unwrap();

    harness
        .manager
        .checkpoint_suggested(tag(100), "state-100".to_string())
        .unwrap();
    let envelope = harness.next_request();
    match envelope.request {
        IoRequest::Write {
            stream,
            expected_version,
            events,
        } => {
            assert_eq!(stream, "$projections-totals-checkpoint");
            assert_eq!(expected_version, NO_STREAM);
            assert_eq!(events[0].event_type, CHECKPOINT_EVENT_TYPE);
            assert_eq!(events[0].data, "state-100");
            assert_eq!(events[0].metadata, tag(100).to_metadata());
        }
        other => panic!("expected write, got {other:?}"),
    }

    let completed = harness
        .manager
        .handle_write_completed(WriteCompleted {
            result: WriteResult::Success,
            first_event_number: 0,
        })
        .unwrap();
    assert_eq!(completed, Some(tag(100)));
    assert!(harness.manager.idle());
}

#[test]
fn test_checkpoint_parked_until_emits_drain() {
    let mut harness = Harness::new(WriteStrategy::Default);
    harness.manager.begin_load();
    harness.next_request();
    harness
        .manager
        .handle_load_read(BackwardReadCompleted::no_stream())
        .unwrap();

    // An emit caused by tag 90 is still unwritten.
    harness
        .manager
        .events_emitted(vec![EmittedEvent::new("$out", "X", "data", tag(90))])
        .unwrap();
    // Recovery read for $out.
    let recovery = harness.next_request();
    assert!(matches!(recovery.route, IoRoute::EmittedRecovery { .. }));

    harness
        .manager
        .checkpoint_suggested(tag(100), "state".to_string())
        .unwrap();
    assert_eq!(harness.manager.checkpoint_status(), "requested");
    harness.no_request();

    // $out recovery completes and the emit is written.
    harness
        .manager
        .handle_emitted_io(
            &IoRoute::EmittedRecovery {
                stream: "$out".to_string(),
            },
            IoCompletion::ReadBackward(BackwardReadCompleted::no_stream()),
        )
        .unwrap();
    let write = harness.next_request();
    assert!(matches!(write.route, IoRoute::EmittedWrite { .. }));
    harness.manager.poll().unwrap();
    // Still parked: the emit write has not completed.
    assert_eq!(harness.manager.checkpoint_status(), "requested");
    harness.no_request();

    harness
        .manager
        .handle_emitted_io(
            &IoRoute::EmittedWrite {
                stream: "$out".to_string(),
            },
            IoCompletion::Write(WriteCompleted {
                result: WriteResult::Success,
                first_event_number: 0,
            }),
        )
        .unwrap();
    harness.manager.poll().unwrap();
    assert_eq!(harness.manager.checkpoint_status(), "writing");
    let envelope = harness.next_request();
    assert!(matches!(envelope.route, IoRoute::CheckpointWrite));
}

#[test]
fn test_stale_suggestions_ignored() {
    let mut harness = Harness::new(WriteStrategy::Default);
    harness.manager.begin_load();
    harness.next_request();
    harness
        .manager
        .handle_load_read(success_page(
            vec![checkpoint_event(0, &tag(200), "state")],
            0,
            -1,
        ))
        .unwrap();

    // At or before the loaded checkpoint: nothing to do.
    harness
        .manager
        .checkpoint_suggested(tag(150), "stale".to_string())
        .unwrap();
    assert_eq!(harness.manager.checkpoint_status(), "");
    harness.no_request();
}

#[test]
fn test_wrong_expected_version_requests_restart() {
    let mut harness = Harness::new(WriteStrategy::Default);
    harness.manager.begin_load();
    harness.next_request();
    harness
        .manager
        .handle_load_read(BackwardReadCompleted::no_stream())
        .unwrap();
    harness
        .manager
        .checkpoint_suggested(tag(100), "state".to_string())
        .unwrap();
    harness.next_request();

    let result = harness.manager.handle_write_completed(WriteCompleted {
        result: WriteResult::WrongExpectedVersion,
        first_event_number: -1,
    });
    assert!(matches!(result, Err(EmitFault::Restart(_))));
}

#[test]
fn test_timeout_retries_checkpoint_write() {
    let mut harness = Harness::new(WriteStrategy::Default);
    harness.manager.begin_load();
    harness.next_request();
    harness
        .manager
        .handle_load_read(BackwardReadCompleted::no_stream())
        .unwrap();
    harness
        .manager
        .checkpoint_suggested(tag(100), "state".to_string())
        .unwrap();
    harness.next_request();

    let outcome = harness
        .manager
        .handle_write_completed(WriteCompleted {
            result: WriteResult::PrepareTimeout,
            first_event_number: -1,
        })
        .unwrap();
    assert!(outcome.is_none());
    let delay = harness.next_request();
    assert!(matches!(delay.route, IoRoute::CheckpointRetry));

    harness.manager.handle_retry_timer().unwrap();
    let retry = harness.next_request();
    match retry.request {
        IoRequest::Write {
            expected_version, ..
        } => assert_eq!(expected_version, NO_STREAM),
        other => panic!("expected write, got {other:?}"),
    }
}

#[test]
fn test_partitioned_strategy_persists_partition_state() {
    let mut harness = Harness::new(WriteStrategy::Partitioned);
    harness.manager.begin_load();
    harness.next_request();
    harness
        .manager
        .handle_load_read(BackwardReadCompleted::no_stream())
        .unwrap();

    harness
        .manager
        .partition_created("account-1", &tag(100))
        .unwrap();
    let catalog = harness.next_request();
    match catalog.route {
        IoRoute::EmittedRecovery { stream } => {
            assert_eq!(stream, "$projections-totals-partitions");
        }
        other => panic!("expected catalog recovery, got {other:?}"),
    }

    // Duplicate registration is a no-op.
    harness
        .manager
        .partition_created("account-1", &tag(110))
        .unwrap();
    harness.no_request();

    harness
        .manager
        .partition_state_updated("account-1", "{\"n\":1}", &tag(100))
        .unwrap();
    let state = harness.next_request();
    match state.route {
        IoRoute::EmittedRecovery { stream } => {
            assert_eq!(stream, "$projections-totals-account-1-state");
        }
        other => panic!("expected state recovery, got {other:?}"),
    }
}

#[test]
fn test_default_strategy_skips_partition_persistence() {
    let mut harness = Harness::new(WriteStrategy::Default);
    harness.manager.begin_load();
    harness.next_request();
    harness
        .manager
        .handle_load_read(BackwardReadCompleted::no_stream())
        .unwrap();

    harness
        .manager
        .partition_created("account-1", &tag(100))
        .unwrap();
    harness
        .manager
        .partition_state_updated("account-1", "{}", &tag(100))
        .unwrap();
    harness.no_request();
}
