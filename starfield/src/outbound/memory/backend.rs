//! Shared in-process backend of record.
//!
//! One [`InMemoryBackend`] plays the role of the remote store for every
//! client in a process. Tables are JSON rows behind a single mutex; writes
//! fan out change events to matching subscriptions after the lock's
//! critical section has produced them. Session credentials are opaque tokens
//! issued by the identity adapter and can be revoked at any time; the
//! service credential never expires.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use mockable::Clock;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::domain::ParticipantId;
use crate::domain::ports::{
    ChangeEvent, ChangeKind, EventFilter, Filter, OrderBy, Procedure, Record, RemoteStoreError,
    SubscriptionHandle, Table, compare_values,
};
use crate::domain::records::columns;

/// Credential a store client acts under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// A participant session token.
    Session(String),
    /// The elevated service credential.
    Service,
}

struct Subscription {
    table: Table,
    filter: EventFilter,
    sink: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct BackendState {
    tables: HashMap<Table, Vec<Record>>,
    subscriptions: BTreeMap<u64, Subscription>,
    next_subscription: u64,
    sessions: HashSet<String>,
    accounts: HashMap<String, ParticipantId>,
    failing_tables: HashSet<Table>,
}

impl BackendState {
    fn rows(&self, table: Table) -> &[Record] {
        self.tables.get(&table).map_or(&[], Vec::as_slice)
    }

    fn rows_mut(&mut self, table: Table) -> &mut Vec<Record> {
        self.tables.entry(table).or_default()
    }

    fn check_writable(&self, table: Table) -> Result<(), RemoteStoreError> {
        if self.failing_tables.contains(&table) {
            return Err(RemoteStoreError::connection(format!(
                "writes to {table} are failing"
            )));
        }
        Ok(())
    }
}

/// Handle to the shared backend. Cloning shares the same tables.
#[derive(Clone)]
pub struct InMemoryBackend {
    state: Arc<Mutex<BackendState>>,
    clock: Arc<dyn Clock>,
}

type Events = Vec<ChangeEvent>;

impl InMemoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState::default())),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BackendState>, RemoteStoreError> {
        self.state
            .lock()
            .map_err(|_| RemoteStoreError::connection("backend state lock poisoned"))
    }

    /// Run `op` under the lock, then deliver the events it produced.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut BackendState) -> Result<(T, Events), RemoteStoreError>,
    ) -> Result<T, RemoteStoreError> {
        let mut state = self.lock()?;
        let (value, events) = op(&mut *state)?;
        dispatch(&mut *state, events);
        Ok(value)
    }

    /// Check that `credential` may perform ordinary calls.
    pub fn authorize(&self, credential: &Credential) -> Result<(), RemoteStoreError> {
        match credential {
            Credential::Service => Ok(()),
            Credential::Session(token) => {
                if self.lock()?.sessions.contains(token) {
                    Ok(())
                } else {
                    Err(RemoteStoreError::unauthorized("session is not valid"))
                }
            }
        }
    }

    /// Issue a session token for `handle`, creating the account on first use.
    pub fn open_session(&self, handle: &str) -> Result<(ParticipantId, String), RemoteStoreError> {
        let mut state = self.lock()?;
        let id = *state
            .accounts
            .entry(handle.to_lowercase())
            .or_insert_with(ParticipantId::random);
        let token = Uuid::new_v4().to_string();
        state.sessions.insert(token.clone());
        Ok((id, token))
    }

    /// Invalidate a session token. Unknown tokens are ignored.
    pub fn revoke_session(&self, token: &str) -> Result<(), RemoteStoreError> {
        self.lock()?.sessions.remove(token);
        Ok(())
    }

    /// Make every write to `table` fail until [`InMemoryBackend::heal`].
    pub fn fail_writes_to(&self, table: Table) -> Result<(), RemoteStoreError> {
        self.lock()?.failing_tables.insert(table);
        Ok(())
    }

    pub fn heal(&self) -> Result<(), RemoteStoreError> {
        self.lock()?.failing_tables.clear();
        Ok(())
    }

    /// Snapshot of a table, for assertions and diagnostics.
    pub fn dump(&self, table: Table) -> Result<Vec<Record>, RemoteStoreError> {
        Ok(self.lock()?.rows(table).to_vec())
    }

    pub fn subscription_count(&self) -> Result<usize, RemoteStoreError> {
        Ok(self.lock()?.subscriptions.len())
    }

    pub fn upsert(
        &self,
        table: Table,
        key_columns: &[&str],
        values: Record,
    ) -> Result<Record, RemoteStoreError> {
        if key_columns.is_empty() {
            return Err(RemoteStoreError::rejected("upsert needs at least one key column"));
        }
        let mut key = Filter::all();
        for column in key_columns {
            let value = values.get(*column).cloned().ok_or_else(|| {
                RemoteStoreError::rejected(format!("upsert value missing key column {column}"))
            })?;
            key = key.column_eq(column, value);
        }
        self.mutate(|state| {
            state.check_writable(table)?;
            let existing = state
                .rows_mut(table)
                .iter_mut()
                .find(|row| key.matches(row));
            if let Some(row) = existing {
                let old = row.clone();
                merge(row, &values);
                let new = row.clone();
                let event = changed(table, ChangeKind::Updated, Some(new.clone()), Some(old));
                return Ok((new, vec![event]));
            }
            let row = insert_checked(state, table, values)?;
            let event = changed(table, ChangeKind::Inserted, Some(row.clone()), None);
            Ok((row, vec![event]))
        })
    }

    pub fn insert(&self, table: Table, values: Record) -> Result<Record, RemoteStoreError> {
        self.mutate(|state| {
            state.check_writable(table)?;
            let row = insert_checked(state, table, values)?;
            let event = changed(table, ChangeKind::Inserted, Some(row.clone()), None);
            Ok((row, vec![event]))
        })
    }

    pub fn update(
        &self,
        table: Table,
        filter: &Filter,
        values: &Record,
    ) -> Result<u64, RemoteStoreError> {
        self.mutate(|state| {
            state.check_writable(table)?;
            let events = update_rows(state, table, filter, values);
            Ok((events.len() as u64, events))
        })
    }

    pub fn delete(&self, table: Table, filter: &Filter) -> Result<u64, RemoteStoreError> {
        self.mutate(|state| {
            state.check_writable(table)?;
            let rows = state.rows_mut(table);
            let (removed, kept): (Vec<Record>, Vec<Record>) =
                rows.drain(..).partition(|row| filter.matches(row));
            *rows = kept;
            let events: Events = removed
                .into_iter()
                .map(|row| changed(table, ChangeKind::Deleted, None, Some(row)))
                .collect();
            Ok((events.len() as u64, events))
        })
    }

    pub fn select(
        &self,
        table: Table,
        filter: &Filter,
        order: Option<&OrderBy>,
    ) -> Result<Vec<Record>, RemoteStoreError> {
        let state = self.lock()?;
        let mut rows: Vec<Record> = state
            .rows(table)
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        if let Some(order) = order {
            rows.sort_by(|a, b| {
                let ordering = match (a.get(&order.column), b.get(&order.column)) {
                    (Some(a), Some(b)) => compare_values(a, b).unwrap_or(std::cmp::Ordering::Equal),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        Ok(rows)
    }

    pub fn subscribe(
        &self,
        table: Table,
        filter: EventFilter,
        sink: mpsc::UnboundedSender<ChangeEvent>,
    ) -> Result<SubscriptionHandle, RemoteStoreError> {
        let mut state = self.lock()?;
        state.next_subscription += 1;
        let id = state.next_subscription;
        state.subscriptions.insert(id, Subscription { table, filter, sink });
        debug!(%table, handle = id, "subscription opened");
        Ok(SubscriptionHandle(id))
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), RemoteStoreError> {
        self.lock()?
            .subscriptions
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| RemoteStoreError::not_found(format!("subscription {}", handle.0)))
    }

    /// Run a server-side procedure. `credential` has already been
    /// authorised for ordinary calls.
    pub fn call(
        &self,
        credential: &Credential,
        procedure: Procedure,
        args: &Value,
    ) -> Result<Value, RemoteStoreError> {
        match procedure {
            Procedure::UpdatePosition => self.update_position(args),
            Procedure::MarkOffline => {
                if *credential != Credential::Service {
                    return Err(RemoteStoreError::unauthorized(
                        "mark_participant_offline requires the service credential",
                    ));
                }
                self.mark_offline(args)
            }
            Procedure::Follow => self.follow(args),
            Procedure::MutualFriends => self.mutual_friends(args),
            Procedure::CheckFriendship => {
                let a = arg(args, "a")?;
                let b = arg(args, "b")?;
                let state = self.lock()?;
                Ok(Value::Bool(follows(&state, &a, &b) && follows(&state, &b, &a)))
            }
            Procedure::ResetPositions => self.reset_positions(),
        }
    }

    fn update_position(&self, args: &Value) -> Result<Value, RemoteStoreError> {
        let id = arg(args, "participant_id")?;
        let x = coordinate(args, "x")?;
        let y = coordinate(args, "y")?;
        self.mutate(|state| {
            state.check_writable(Table::Participants)?;
            let filter = Filter::all().column_eq(columns::ID, id.clone());
            let values = crate::domain::records::record(json!({ "x": x, "y": y }));
            let events = update_rows(state, Table::Participants, &filter, &values);
            let Some(row) = events.first().and_then(|e| e.new_row.clone()) else {
                return Err(RemoteStoreError::not_found(format!("participant {id}")));
            };
            Ok((Value::Object(row), events))
        })
    }

    fn mark_offline(&self, args: &Value) -> Result<Value, RemoteStoreError> {
        let handle = arg(args, "handle")?;
        let handle = handle.as_str().unwrap_or_default().to_lowercase();
        let last_seen = args
            .get("last_seen")
            .cloned()
            .unwrap_or_else(|| json!(self.clock.utc()));
        self.mutate(|state| {
            state.check_writable(Table::Participants)?;
            let mut events = Events::new();
            for row in state.rows_mut(Table::Participants).iter_mut() {
                let matches = row
                    .get(columns::HANDLE)
                    .and_then(Value::as_str)
                    .is_some_and(|h| h.to_lowercase() == handle);
                if matches {
                    let old = row.clone();
                    row.insert(columns::ONLINE.to_owned(), Value::Bool(false));
                    row.insert(columns::LAST_SEEN.to_owned(), last_seen.clone());
                    events.push(changed(
                        Table::Participants,
                        ChangeKind::Updated,
                        Some(row.clone()),
                        Some(old),
                    ));
                }
            }
            Ok((json!(events.len()), events))
        })
    }

    fn follow(&self, args: &Value) -> Result<Value, RemoteStoreError> {
        let follower = arg(args, "follower_id")?;
        let followee = arg(args, "followee_id")?;
        let now = json!(self.clock.utc());
        self.mutate(|state| {
            state.check_writable(Table::Follows)?;
            let mut events = Events::new();
            if !follows(state, &follower, &followee) {
                let row = crate::domain::records::record(json!({
                    "id": Uuid::new_v4(),
                    "follower_id": follower,
                    "followee_id": followee,
                    "created_at": now,
                }));
                state.rows_mut(Table::Follows).push(row.clone());
                events.push(changed(Table::Follows, ChangeKind::Inserted, Some(row), None));

                if follows(state, &followee, &follower) {
                    let event_row = crate::domain::records::record(json!({
                        "id": Uuid::new_v4(),
                        "first_id": follower,
                        "second_id": followee,
                        "created_at": now,
                    }));
                    state.rows_mut(Table::FriendshipEvents).push(event_row.clone());
                    events.push(changed(
                        Table::FriendshipEvents,
                        ChangeKind::Inserted,
                        Some(event_row),
                        None,
                    ));
                }
            }
            let mutual = follows(state, &followee, &follower);
            Ok((json!({ "mutual": mutual }), events))
        })
    }

    fn mutual_friends(&self, args: &Value) -> Result<Value, RemoteStoreError> {
        let me = arg(args, "participant_id")?;
        let state = self.lock()?;
        let friends: Vec<Value> = state
            .rows(Table::Follows)
            .iter()
            .filter(|row| row.get(columns::FOLLOWER_ID) == Some(&me))
            .filter_map(|row| row.get(columns::FOLLOWEE_ID).cloned())
            .filter(|friend| follows(&state, friend, &me))
            .map(|friend| {
                let handle = state
                    .rows(Table::Participants)
                    .iter()
                    .find(|p| p.get(columns::ID) == Some(&friend))
                    .and_then(|p| p.get(columns::HANDLE).cloned())
                    .unwrap_or(Value::Null);
                json!({ "friend_id": friend, "handle": handle })
            })
            .collect();
        Ok(Value::Array(friends))
    }

    fn reset_positions(&self) -> Result<Value, RemoteStoreError> {
        self.mutate(|state| {
            state.check_writable(Table::Participants)?;
            let mut events = Events::new();
            for row in state.rows_mut(Table::Participants).iter_mut() {
                let (Some(x), Some(y)) = (
                    row.get(columns::ORIGIN_X).cloned(),
                    row.get(columns::ORIGIN_Y).cloned(),
                ) else {
                    continue;
                };
                let old = row.clone();
                row.insert(columns::X.to_owned(), x);
                row.insert(columns::Y.to_owned(), y);
                events.push(changed(
                    Table::Participants,
                    ChangeKind::Updated,
                    Some(row.clone()),
                    Some(old),
                ));
            }
            Ok((json!(events.len()), events))
        })
    }
}

fn changed(
    table: Table,
    kind: ChangeKind,
    new_row: Option<Record>,
    old_row: Option<Record>,
) -> ChangeEvent {
    ChangeEvent {
        table,
        kind,
        new_row,
        old_row,
    }
}

fn merge(row: &mut Record, values: &Record) {
    for (column, value) in values {
        row.insert(column.clone(), value.clone());
    }
}

fn update_rows(state: &mut BackendState, table: Table, filter: &Filter, values: &Record) -> Events {
    let mut events = Events::new();
    for row in state.rows_mut(table).iter_mut().filter(|row| filter.matches(row)) {
        let old = row.clone();
        merge(row, values);
        events.push(changed(table, ChangeKind::Updated, Some(row.clone()), Some(old)));
    }
    events
}

/// Insert with id assignment and the table's unique constraints.
fn insert_checked(
    state: &mut BackendState,
    table: Table,
    mut values: Record,
) -> Result<Record, RemoteStoreError> {
    if !values.contains_key(columns::ID) {
        values.insert(columns::ID.to_owned(), json!(Uuid::new_v4()));
    }
    let id = values.get(columns::ID).cloned();
    let rows = state.rows(table);
    if rows.iter().any(|row| row.get(columns::ID) == id.as_ref()) {
        return Err(RemoteStoreError::rejected(format!("duplicate id in {table}")));
    }
    if table == Table::Memberships {
        let participant = values.get(columns::PARTICIPANT_ID);
        if participant.is_none() {
            return Err(RemoteStoreError::rejected("membership needs participant_id"));
        }
        if rows
            .iter()
            .any(|row| row.get(columns::PARTICIPANT_ID) == participant)
        {
            return Err(RemoteStoreError::rejected(
                "participant already holds a membership",
            ));
        }
    }
    state.rows_mut(table).push(values.clone());
    Ok(values)
}

fn follows(state: &BackendState, follower: &Value, followee: &Value) -> bool {
    state.rows(Table::Follows).iter().any(|row| {
        row.get(columns::FOLLOWER_ID) == Some(follower)
            && row.get(columns::FOLLOWEE_ID) == Some(followee)
    })
}

fn arg(args: &Value, name: &str) -> Result<Value, RemoteStoreError> {
    args.get(name)
        .filter(|value| !value.is_null())
        .cloned()
        .ok_or_else(|| RemoteStoreError::procedure(format!("missing argument {name}")))
}

fn coordinate(args: &Value, name: &str) -> Result<f64, RemoteStoreError> {
    arg(args, name)?
        .as_f64()
        .filter(|value| (0.0..=1.0).contains(value))
        .ok_or_else(|| RemoteStoreError::procedure(format!("{name} must be a number in [0, 1]")))
}

/// Deliver events to matching subscriptions, dropping closed sinks.
fn dispatch(state: &mut BackendState, events: Events) {
    if events.is_empty() {
        return;
    }
    let mut closed = Vec::new();
    for (id, subscription) in &state.subscriptions {
        for event in events
            .iter()
            .filter(|event| event.table == subscription.table && subscription.filter.accepts(event))
        {
            if subscription.sink.send(event.clone()).is_err() {
                closed.push(*id);
                break;
            }
        }
    }
    for id in closed {
        debug!(handle = id, "dropping subscription with closed sink");
        state.subscriptions.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    //! Regression coverage for this module.

    use chrono::{TimeZone, Utc};
    use rstest::{fixture, rstest};

    use super::*;
    use crate::domain::records::record;
    use crate::test_support::MutableClock;

    #[fixture]
    fn backend() -> InMemoryBackend {
        InMemoryBackend::new(Arc::new(MutableClock::new(
            Utc.with_ymd_and_hms(2026, 3, 3, 3, 0, 0)
                .single()
                .expect("valid instant"),
        )))
    }

    #[rstest]
    fn memberships_are_unique_per_participant(backend: InMemoryBackend) {
        let participant = ParticipantId::random();
        backend
            .insert(
                Table::Memberships,
                record(json!({ "participant_id": participant, "room_id": "a" })),
            )
            .expect("first membership");
        let err = backend
            .insert(
                Table::Memberships,
                record(json!({ "participant_id": participant, "room_id": "b" })),
            )
            .expect_err("second membership");
        assert_eq!(err.kind(), "Rejected");
    }

    #[rstest]
    fn upsert_merges_into_matching_row(backend: InMemoryBackend) {
        backend
            .upsert(Table::Participants, &["id"], record(json!({ "id": "p", "x": 0.1 })))
            .expect("insert");
        let merged = backend
            .upsert(Table::Participants, &["id"], record(json!({ "id": "p", "online": true })))
            .expect("merge");
        assert_eq!(merged.get("x"), Some(&json!(0.1)));
        assert_eq!(backend.dump(Table::Participants).expect("dump").len(), 1);
    }

    #[rstest]
    fn select_orders_by_timestamp(backend: InMemoryBackend) {
        for stamp in ["2026-01-01T00:00:00Z", "2026-03-01T00:00:00Z", "2026-02-01T00:00:00Z"] {
            backend
                .insert(Table::Rooms, record(json!({ "created_at": stamp })))
                .expect("insert");
        }
        let rows = backend
            .select(Table::Rooms, &Filter::all(), Some(&OrderBy::descending("created_at")))
            .expect("select");
        let stamps: Vec<_> = rows.iter().filter_map(|r| r.get("created_at")).collect();
        assert_eq!(
            stamps,
            vec![
                &json!("2026-03-01T00:00:00Z"),
                &json!("2026-02-01T00:00:00Z"),
                &json!("2026-01-01T00:00:00Z"),
            ]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn writes_push_to_matching_subscribers(backend: InMemoryBackend) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        backend
            .subscribe(
                Table::Memberships,
                EventFilter::only(ChangeKind::Deleted),
                tx,
            )
            .expect("subscribe");
        backend
            .insert(Table::Memberships, record(json!({ "participant_id": "p", "room_id": "r" })))
            .expect("insert");
        backend
            .delete(Table::Memberships, &Filter::all().column_eq("participant_id", "p"))
            .expect("delete");

        let event = rx.recv().await.expect("deleted event");
        assert_eq!(event.kind, ChangeKind::Deleted);
        assert!(rx.try_recv().is_err());
    }

    #[rstest]
    fn mark_offline_needs_service_credential(backend: InMemoryBackend) {
        let (_, token) = backend.open_session("vega").expect("session");
        let err = backend
            .call(
                &Credential::Session(token),
                Procedure::MarkOffline,
                &json!({ "handle": "vega" }),
            )
            .expect_err("session credential");
        assert_eq!(err.kind(), "Unauthorized");
    }

    #[rstest]
    fn second_follow_completes_friendship(backend: InMemoryBackend) {
        let a = json!(ParticipantId::random());
        let b = json!(ParticipantId::random());
        let first = backend
            .call(&Credential::Service, Procedure::Follow, &json!({ "follower_id": a, "followee_id": b }))
            .expect("follow");
        assert_eq!(first, json!({ "mutual": false }));
        let second = backend
            .call(&Credential::Service, Procedure::Follow, &json!({ "follower_id": b, "followee_id": a }))
            .expect("follow back");
        assert_eq!(second, json!({ "mutual": true }));
        assert_eq!(backend.dump(Table::FriendshipEvents).expect("dump").len(), 1);
    }

    #[rstest]
    fn failing_tables_reject_writes_until_healed(backend: InMemoryBackend) {
        backend.fail_writes_to(Table::Rooms).expect("inject");
        assert!(backend.insert(Table::Rooms, record(json!({}))).is_err());
        backend.heal().expect("heal");
        assert!(backend.insert(Table::Rooms, record(json!({}))).is_ok());
    }
}
