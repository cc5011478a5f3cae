//! End-to-end edit sessions against the public engine API.

use bisync_engine::{
    Completion, Converted, Document, EditOutcome, EditPermissions, EngineConfig, EngineEvent,
    ErrorClass, ErrorCode, ManualClock, MockResponse, MockTransformer, RetryConfig, Side, SnapshotTrigger,
    SyncEngine, SyncError, SystemState, Timestamp, TransformError,
};
use bytes::Bytes;
use std::sync::Arc;

struct Session {
    engine: SyncEngine<MockTransformer>,
    clock: ManualClock,
}

impl Session {
    fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    fn with_config(config: EngineConfig) -> Self {
        let clock = ManualClock::new();
        let engine = SyncEngine::with_clock(
            config.with_jitter_seed(7),
            MockTransformer::new(),
            Document::new("blocks v1", "text v1", "model v1"),
            Arc::new(clock.clone()),
        )
        .unwrap();
        Self { engine, clock }
    }

    fn advance_to(&mut self, ms: u64) {
        self.clock.set(Timestamp(ms));
        self.engine.tick();
    }

    fn event_names(&self) -> Vec<&'static str> {
        self.engine
            .events()
            .poll(0, usize::MAX)
            .into_iter()
            .map(|r| r.name)
            .collect()
    }
}

#[test]
fn debounced_edit_converts_and_snapshots() {
    let mut s = Session::new();
    s.engine.transformer().push(MockResponse::Defer);

    s.engine.handle_edit(Side::A, "blocks v2").unwrap();
    s.advance_to(299);
    assert_eq!(s.engine.current_state(), SystemState::DirtyA);

    s.advance_to(300);
    assert_eq!(s.engine.current_state(), SystemState::Converting);
    let ticket = s.engine.in_flight().unwrap();
    assert_eq!(ticket.origin, Side::A);

    let before = s.engine.history().len();
    s.clock.set(Timestamp(320));
    let done = s
        .engine
        .handle_sync_success(ticket, Converted::new("model v2", "text v2"))
        .unwrap();

    assert_eq!(done, Completion::Applied);
    assert_eq!(s.engine.current_state(), SystemState::Synced);
    assert_eq!(s.engine.history().len(), before + 1);
    let latest = s.engine.history().pop().unwrap();
    assert_eq!(latest.trigger(), SnapshotTrigger::SyncCompletion);
    assert_eq!(latest.timestamp(), Timestamp(320));
    assert_eq!(
        latest.captured().document,
        Document::new("blocks v2", "text v2", "model v2")
    );
}

#[test]
fn three_data_errors_return_to_dirty_side_with_content() {
    let mut s = Session::with_config(
        EngineConfig::default().with_retry(RetryConfig::default().with_jitter_fraction(0.0)),
    );
    s.engine
        .transformer()
        .fail_times(3, TransformError::malformed("unexpected token"));

    s.engine.handle_edit(Side::A, "blocks v2").unwrap();
    s.advance_to(300);
    assert_eq!(s.engine.current_state(), SystemState::Converting);
    s.advance_to(400);
    assert_eq!(s.engine.current_state(), SystemState::Converting);
    s.advance_to(600);

    assert_eq!(s.engine.current_state(), SystemState::DirtyA);
    assert_eq!(s.engine.transformer().call_count(), 3);
    assert_eq!(
        s.engine.document().side(Side::A),
        &Bytes::from_static(b"blocks v2")
    );
    assert_eq!(s.engine.document().model(), &Bytes::from_static(b"model v1"));
    assert_eq!(s.engine.edit_permissions(), EditPermissions::only(Side::A));

    let recovered = s
        .engine
        .events()
        .poll(0, usize::MAX)
        .into_iter()
        .find_map(|r| match r.event {
            EngineEvent::StateRecovered(notice) => Some(notice),
            _ => None,
        })
        .unwrap();
    assert_eq!(recovered.from_state, SystemState::Converting);
    assert_eq!(recovered.to_state, SystemState::DirtyA);
    assert_eq!(recovered.classification, ErrorClass::Data);
    assert_eq!(recovered.reason, "unexpected token");
}

#[test]
fn retry_after_data_error_can_succeed() {
    let mut s = Session::with_config(
        EngineConfig::default().with_retry(RetryConfig::default().with_jitter_fraction(0.0)),
    );
    s.engine
        .transformer()
        .push(MockResponse::Fail(TransformError::new(
            ErrorCode::SchemaMismatch,
            "missing field",
        )));

    s.engine.handle_edit(Side::B, "text v2").unwrap();
    s.advance_to(300);
    s.advance_to(400);

    assert_eq!(s.engine.current_state(), SystemState::Synced);
    assert_eq!(s.engine.stats().retries, 1);
    assert_eq!(s.engine.stats().syncs_completed, 1);
    assert!(s.event_names().contains(&"sync.retrying"));
}

#[test]
fn timeout_returns_to_last_snapshot() {
    let mut s = Session::new();
    s.engine.handle_edit(Side::A, "blocks v2").unwrap();
    s.advance_to(300);
    let synced = s.engine.document().clone();

    s.engine.transformer().push(MockResponse::Defer);
    s.engine.handle_edit(Side::B, "text v3").unwrap();
    s.engine.trigger_sync().unwrap();
    assert_eq!(s.engine.current_state(), SystemState::Converting);

    s.advance_to(5299);
    assert_eq!(s.engine.current_state(), SystemState::Converting);
    s.advance_to(5300);

    assert_eq!(s.engine.current_state(), SystemState::Synced);
    assert_eq!(s.engine.document(), &synced);
    assert_eq!(s.engine.edit_permissions(), EditPermissions::BOTH);
    let names = s.event_names();
    assert!(names.contains(&"state.recovered"));
    assert!(names.contains(&"version.rolledback"));
}

#[test]
fn late_data_error_gives_up_instead_of_outliving_the_deadline() {
    let mut s = Session::new();
    s.engine.transformer().push(MockResponse::Defer);
    s.engine.handle_edit(Side::A, "blocks v2").unwrap();
    let ticket = s.engine.trigger_sync().unwrap();

    s.advance_to(4900);
    s.engine
        .handle_sync_failed(ticket, TransformError::malformed("truncated"))
        .unwrap();
    assert_eq!(s.engine.current_state(), SystemState::DirtyA);
    assert_eq!(s.engine.stats().retries, 0);

    s.advance_to(5000);
    assert_eq!(s.engine.current_state(), SystemState::DirtyA);
    assert_eq!(s.engine.document().side(Side::A), &Bytes::from_static(b"blocks v2"));
    assert_eq!(s.engine.stats().data_recoveries, 1);
}

#[test]
fn retries_share_the_first_attempts_deadline() {
    let mut s = Session::new();
    s.engine.transformer().push(MockResponse::Defer);
    s.engine.transformer().push(MockResponse::Defer);
    s.engine.handle_edit(Side::B, "text v2").unwrap();
    let first = s.engine.trigger_sync().unwrap();

    s.advance_to(4000);
    s.engine
        .handle_sync_failed(first, TransformError::malformed("truncated"))
        .unwrap();
    s.advance_to(4200);
    let second = s.engine.in_flight().unwrap();
    assert_eq!(second.attempt, 2);
    assert_eq!(s.engine.transformer().call_count(), 2);

    s.advance_to(4999);
    assert_eq!(s.engine.current_state(), SystemState::Converting);
    s.advance_to(5000);

    assert_eq!(s.engine.current_state(), SystemState::Synced);
    assert_eq!(s.engine.document(), &Document::new("blocks v1", "text v1", "model v1"));
    assert_eq!(s.engine.stats().timeouts, 1);
    assert_eq!(
        s.engine.handle_sync_success(second, Converted::new("m", "o")).unwrap(),
        Completion::Discarded
    );
}

#[test]
fn only_last_buffered_edit_is_replayed() {
    let mut s = Session::new();
    s.engine.transformer().push(MockResponse::Defer);

    s.engine.handle_edit(Side::A, "draft").unwrap();
    let ticket = s.engine.trigger_sync().unwrap();

    assert_eq!(
        s.engine.handle_edit(Side::A, "payload one").unwrap(),
        EditOutcome::Buffered { replaced: false }
    );
    assert_eq!(
        s.engine.handle_edit(Side::A, "payload two").unwrap(),
        EditOutcome::Buffered { replaced: true }
    );
    assert!(matches!(
        s.engine.handle_edit(Side::B, "other side"),
        Err(SyncError::EditNotPermitted { .. })
    ));

    s.engine
        .handle_sync_success(ticket, Converted::new("draft", "draft"))
        .unwrap();
    s.advance_to(300);

    let inputs: Vec<Bytes> = s
        .engine
        .transformer()
        .calls()
        .into_iter()
        .map(|(_, input)| input)
        .collect();
    assert_eq!(
        inputs,
        vec![Bytes::from_static(b"draft"), Bytes::from_static(b"payload two")]
    );
    assert_eq!(s.engine.current_state(), SystemState::Synced);
}

#[test]
fn buffered_edit_survives_data_fallback() {
    let mut s = Session::with_config(EngineConfig::default().with_retry(RetryConfig::no_retry()));
    s.engine.transformer().push(MockResponse::Defer);

    s.engine.handle_edit(Side::B, "text v2").unwrap();
    let ticket = s.engine.trigger_sync().unwrap();
    s.engine.handle_edit(Side::B, "text v3").unwrap();

    s.engine
        .handle_sync_failed(ticket, TransformError::syntax("line 4"))
        .unwrap();
    assert_eq!(s.engine.current_state(), SystemState::DirtyB);
    assert_eq!(
        s.engine.document().side(Side::B),
        &Bytes::from_static(b"text v3")
    );
    assert!(s.engine.next_deadline().is_some());
}

#[test]
fn rollback_cancels_in_flight_conversion() {
    let mut s = Session::new();
    s.engine.transformer().push(MockResponse::Defer);
    s.engine.handle_edit(Side::A, "blocks v2").unwrap();
    let ticket = s.engine.trigger_sync().unwrap();

    let result = s.engine.rollback_to_version(None).unwrap();
    assert_eq!(result.ordinal, 1);
    assert_eq!(s.engine.current_state(), SystemState::Synced);
    assert_eq!(s.engine.in_flight(), None);

    let late = s
        .engine
        .handle_sync_failed(ticket, TransformError::malformed("late"))
        .unwrap();
    assert_eq!(late, Completion::Discarded);
    assert_eq!(s.engine.stats().failures, 0);
}

#[test]
fn history_is_bounded() {
    let mut s = Session::with_config(EngineConfig::default().with_max_history(10));
    for n in 0..12u64 {
        s.engine.handle_edit(Side::A, format!("blocks {n}")).unwrap();
        s.engine.trigger_sync().unwrap();
    }
    let history = s.engine.history();
    assert_eq!(history.len(), 10);
    assert_eq!(history[0].ordinal(), 4);
    assert_eq!(history[9].ordinal(), 13);
}

#[test]
fn event_names_are_lowercase_dotted() {
    let mut s = Session::new();
    s.engine.handle_edit(Side::A, "x").unwrap();
    s.advance_to(300);
    s.engine.rollback_to_version(None).unwrap();

    for name in s.event_names() {
        assert!(name.contains('.'));
        assert!(!name.contains('_'));
        assert_eq!(name, name.to_lowercase());
    }
}
