//! Tests for `PositionSynchronizer`.

use chrono::{TimeZone, Utc};
use rstest::{fixture, rstest};
use serde_json::Value;

use super::*;
use crate::domain::ports::MockRemoteStore;
use crate::domain::{ErrorCode, Handle};

struct Harness {
    session: Session,
    view: ParticipantView,
    outcomes: mpsc::UnboundedReceiver<SyncOutcome>,
}

fn session() -> Session {
    Session {
        participant_id: ParticipantId::random(),
        handle: Handle::new("lyra").expect("valid handle"),
        started_at: Utc
            .with_ymd_and_hms(2026, 6, 1, 9, 30, 0)
            .single()
            .expect("valid instant"),
    }
}

fn local_row(id: ParticipantId, x: f64, y: f64) -> ParticipantRow {
    ParticipantRow {
        id: Some(id),
        handle: Some("lyra".to_owned()),
        x: Some(x),
        y: Some(y),
        online: Some(true),
        ..ParticipantRow::default()
    }
}

#[fixture]
fn harness() -> (Harness, mpsc::UnboundedSender<SyncOutcome>) {
    let session = session();
    let mut view = ParticipantView::new();
    view.upsert_row(&local_row(session.participant_id, 0.5, 0.5))
        .expect("seed local participant");
    view.set_local(Some(session.participant_id));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Harness {
            session,
            view,
            outcomes: rx,
        },
        tx,
    )
}

fn store_accepting_positions() -> MockRemoteStore {
    let mut store = MockRemoteStore::new();
    store
        .expect_call_procedure()
        .withf(|procedure, _| *procedure == Procedure::UpdatePosition)
        .returning(|_, args| Ok(args));
    store
}

#[rstest]
#[tokio::test]
async fn tick_without_session_does_nothing(harness: (Harness, mpsc::UnboundedSender<SyncOutcome>)) {
    let (mut h, tx) = harness;
    let mut sync = PositionSynchronizer::new(Arc::new(MockRemoteStore::new()), 0.01, tx);
    assert_eq!(sync.tick(&mut h.view), None);
}

#[rstest]
#[tokio::test]
async fn tick_moves_local_participant_and_reports_outcome(
    harness: (Harness, mpsc::UnboundedSender<SyncOutcome>),
) {
    let (mut h, tx) = harness;
    let mut sync = PositionSynchronizer::new(Arc::new(store_accepting_positions()), 0.01, tx);
    sync.begin_session(&h.session);
    sync.set_drift(DriftVector::new(0.01, -0.02));

    let next = sync.tick(&mut h.view).expect("tick moves");
    assert!((next.x() - 0.51).abs() < 1e-12);
    assert!((next.y() - 0.48).abs() < 1e-12);
    assert_eq!(h.view.local().expect("local").position, next);

    let outcome = h.outcomes.recv().await.expect("outcome delivered");
    assert_eq!(outcome.position, next);
    assert!(sync.record_outcome(outcome));
    assert!(sync.last_sync_error().is_none());
}

#[rstest]
#[tokio::test]
async fn tick_wraps_at_the_edge(harness: (Harness, mpsc::UnboundedSender<SyncOutcome>)) {
    let (mut h, tx) = harness;
    let id = h.session.participant_id;
    h.view.set_local(None);
    h.view
        .upsert_row(&local_row(id, 0.999, 0.001))
        .expect("move local");
    h.view.set_local(Some(id));

    let mut sync = PositionSynchronizer::new(Arc::new(store_accepting_positions()), 0.01, tx);
    sync.begin_session(&h.session);
    sync.set_drift(DriftVector::new(0.01, -0.01));

    let next = sync.tick(&mut h.view).expect("tick moves");
    assert!((0.0..0.011).contains(&next.x()));
    assert!((0.99..=1.0).contains(&next.y()));
}

#[rstest]
#[tokio::test]
async fn offline_local_participant_does_not_drift(
    harness: (Harness, mpsc::UnboundedSender<SyncOutcome>),
) {
    let (mut h, tx) = harness;
    h.view.set_online(h.session.participant_id, false);
    let mut sync = PositionSynchronizer::new(Arc::new(MockRemoteStore::new()), 0.01, tx);
    sync.begin_session(&h.session);
    assert_eq!(sync.tick(&mut h.view), None);
}

#[rstest]
#[tokio::test]
async fn failed_write_is_observable_and_not_rolled_back(
    harness: (Harness, mpsc::UnboundedSender<SyncOutcome>),
) {
    let (mut h, tx) = harness;
    let mut store = MockRemoteStore::new();
    store
        .expect_call_procedure()
        .returning(|_, _| Err(RemoteStoreError::connection("timed out")));
    let mut sync = PositionSynchronizer::new(Arc::new(store), 0.01, tx);
    sync.begin_session(&h.session);

    let next = sync.tick(&mut h.view).expect("tick moves");
    let outcome = h.outcomes.recv().await.expect("outcome delivered");
    sync.record_outcome(outcome);

    let error = sync.last_sync_error().expect("failure recorded");
    assert_eq!(error.code(), ErrorCode::TransientRemoteFailure);
    assert_eq!(h.view.local().expect("local").position, next);
}

#[rstest]
#[tokio::test]
async fn outcomes_from_ended_sessions_are_discarded(
    harness: (Harness, mpsc::UnboundedSender<SyncOutcome>),
) {
    let (mut h, tx) = harness;
    let mut store = MockRemoteStore::new();
    store
        .expect_call_procedure()
        .returning(|_, _| Err(RemoteStoreError::unauthorized("signed out")));
    let mut sync = PositionSynchronizer::new(Arc::new(store), 0.01, tx);
    sync.begin_session(&h.session);
    sync.tick(&mut h.view).expect("tick moves");
    sync.end_session();

    let outcome = h.outcomes.recv().await.expect("outcome delivered");
    assert!(!sync.record_outcome(outcome));
    assert!(sync.last_sync_error().is_none());
}

#[rstest]
#[tokio::test]
async fn first_sign_in_assigns_and_persists_origin(
    harness: (Harness, mpsc::UnboundedSender<SyncOutcome>),
) {
    let (mut h, tx) = harness;
    let mut store = MockRemoteStore::new();
    store
        .expect_select_where()
        .returning(|_, _, _| Ok(Vec::new()));
    store
        .expect_upsert_row()
        .withf(|table, keys, values| {
            let origin_x = values.get("origin_x").and_then(Value::as_f64);
            *table == Table::Participants
                && keys.len() == 1
                && keys.first() == Some(&columns::ID)
                && origin_x.is_some_and(|x| (0.1..=0.9).contains(&x))
                && values.get("x") == values.get("origin_x")
        })
        .times(1)
        .returning(|_, _, values| Ok(values));
    let sync = PositionSynchronizer::new(Arc::new(store), 0.01, tx);

    let origin = sync
        .initialize_position(h.session.participant_id, &mut h.view)
        .await
        .expect("origin assigned");
    let local = h.view.local().expect("local");
    assert_eq!(local.origin, Some(origin));
    assert_eq!(local.position, origin);
}

#[rstest]
#[tokio::test]
async fn later_sign_in_restores_stored_origin(
    harness: (Harness, mpsc::UnboundedSender<SyncOutcome>),
) {
    let (mut h, tx) = harness;
    let id = h.session.participant_id;
    let mut store = MockRemoteStore::new();
    store.expect_select_where().returning(move |_, _, _| {
        Ok(vec![record(json!({
            "id": id,
            "handle": "lyra",
            "x": 0.8,
            "y": 0.8,
            "origin_x": 0.2,
            "origin_y": 0.3,
        }))])
    });
    store
        .expect_upsert_row()
        .withf(|_, _, values| {
            !values.contains_key("origin_x") && values.get("x") == Some(&json!(0.2))
        })
        .times(1)
        .returning(|_, _, values| Ok(values));
    let sync = PositionSynchronizer::new(Arc::new(store), 0.01, tx);

    let origin = sync
        .initialize_position(id, &mut h.view)
        .await
        .expect("origin restored");
    assert_eq!(origin, Position::new(0.2, 0.3).expect("valid"));
}

#[rstest]
fn remote_rows_move_others_but_own_echoes_leave_the_local_participant(
    harness: (Harness, mpsc::UnboundedSender<SyncOutcome>),
) {
    let (mut h, tx) = harness;
    let sync = PositionSynchronizer::new(Arc::new(MockRemoteStore::new()), 0.01, tx);
    let other = ParticipantId::random();
    let mut row = local_row(other, 0.2, 0.3);
    row.handle = Some("deneb".to_owned());

    sync.on_remote_change(&row, &mut h.view).expect("insert other");
    row.x = Some(0.25);
    sync.on_remote_change(&row, &mut h.view).expect("move other");
    let moved = h.view.get(other).expect("other participant").position;
    assert!((moved.x() - 0.25).abs() < 1e-12);

    h.view
        .remember_write(Position::new(0.9, 0.9).expect("valid position"));
    let echo = local_row(h.session.participant_id, 0.9, 0.9);
    sync.on_remote_change(&echo, &mut h.view).expect("echo");
    let local = h.view.local().expect("local").position;
    assert!((local.x() - 0.5).abs() < 1e-12);
    assert_eq!(h.view.len(), 2);
}

#[rstest]
#[tokio::test]
async fn reset_returns_the_local_participant_to_its_origin(
    harness: (Harness, mpsc::UnboundedSender<SyncOutcome>),
) {
    let (mut h, tx) = harness;
    let id = h.session.participant_id;
    h.view.set_local(None);
    let mut row = local_row(id, 0.7, 0.7);
    row.origin_x = Some(0.2);
    row.origin_y = Some(0.4);
    h.view.upsert_row(&row).expect("seed origin");
    h.view.set_local(Some(id));

    let mut store = MockRemoteStore::new();
    store
        .expect_call_procedure()
        .withf(|procedure, _| *procedure == Procedure::ResetPositions)
        .times(1)
        .returning(|_, _| Ok(Value::from(2)));
    let sync = PositionSynchronizer::new(Arc::new(store), 0.01, tx);

    sync.reset_positions(&mut h.view).await.expect("reset");
    let position = h.view.local().expect("local").position;
    assert!((position.x() - 0.2).abs() < 1e-12);
    assert!((position.y() - 0.4).abs() < 1e-12);
}

#[rstest]
#[tokio::test]
async fn reset_from_another_client_becomes_the_drift_base(
    harness: (Harness, mpsc::UnboundedSender<SyncOutcome>),
) {
    let (mut h, tx) = harness;
    let mut sync = PositionSynchronizer::new(Arc::new(store_accepting_positions()), 0.01, tx);
    sync.begin_session(&h.session);
    sync.set_drift(DriftVector::new(0.01, 0.01));
    let drifted = sync.tick(&mut h.view).expect("first tick");

    let stale_echo = local_row(h.session.participant_id, drifted.x(), drifted.y());
    sync.on_remote_change(&stale_echo, &mut h.view)
        .expect("own echo");
    let reset = local_row(h.session.participant_id, 0.2, 0.4);
    sync.on_remote_change(&reset, &mut h.view).expect("reset push");
    assert_eq!(
        h.view.local().expect("local").position,
        Position::new(0.2, 0.4).expect("valid position")
    );

    let next = sync.tick(&mut h.view).expect("tick after reset");
    assert!((next.x() - 0.21).abs() < 1e-12);
    assert!((next.y() - 0.41).abs() < 1e-12);
}
