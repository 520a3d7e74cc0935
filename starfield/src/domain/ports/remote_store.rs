//! Port abstraction over the shared backend of record.
//!
//! The store is table-oriented and transport agnostic: rows travel as JSON
//! objects ([`Record`]), predicates are conjunctions of column comparisons,
//! and change notifications are pushed into a caller-supplied channel until
//! the subscription is released.

use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::define_port_error;

/// A single row as a JSON object keyed by column name.
pub type Record = Map<String, Value>;

define_port_error! {
    /// Errors raised by remote store adapters.
    pub enum RemoteStoreError {
        /// The store could not be reached or the call did not complete.
        Connection { message: String } => "remote store connection failed: {message}",
        /// The credential used for the call is missing, expired or revoked.
        Unauthorized { message: String } => "remote store rejected credential: {message}",
        /// The write violated a constraint held by the store.
        Rejected { message: String } => "remote store rejected write: {message}",
        /// A procedure or subscription referenced something that does not exist.
        NotFound { message: String } => "remote store lookup failed: {message}",
        /// A server-side procedure failed while executing.
        Procedure { message: String } => "remote procedure failed: {message}",
    }
}

/// Tables watched or written by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Participants,
    Rooms,
    Memberships,
    Bans,
    Follows,
    FriendshipEvents,
    PublicMessages,
    RoomMessages,
    PrivateMessages,
}

impl Table {
    /// Every table, in declaration order.
    pub const ALL: [Self; 9] = [
        Self::Participants,
        Self::Rooms,
        Self::Memberships,
        Self::Bans,
        Self::Follows,
        Self::FriendshipEvents,
        Self::PublicMessages,
        Self::RoomMessages,
        Self::PrivateMessages,
    ];

    /// Storage name of the table.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Participants => "participants",
            Self::Rooms => "rooms",
            Self::Memberships => "room_memberships",
            Self::Bans => "room_bans",
            Self::Follows => "follows",
            Self::FriendshipEvents => "friendship_events",
            Self::PublicMessages => "chat_messages",
            Self::RoomMessages => "room_messages",
            Self::PrivateMessages => "private_messages",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Comparison applied by a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Lt,
}

/// One column comparison inside a [`Filter`].
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub comparison: Comparison,
    pub value: Value,
}

/// Conjunction of column comparisons. An empty filter matches every row.
///
/// # Examples
/// ```
/// use serde_json::json;
/// use starfield::domain::ports::Filter;
///
/// let filter = Filter::all().column_eq("room_id", "r-1");
/// let row = json!({ "room_id": "r-1", "participant_id": "p-1" });
/// assert!(filter.matches(row.as_object().expect("object")));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    /// Filter matching every row.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Require `column == value`.
    #[must_use]
    pub fn column_eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            column: column.to_owned(),
            comparison: Comparison::Eq,
            value: value.into(),
        });
        self
    }

    /// Require `column < value`. Numbers compare numerically and RFC 3339
    /// strings compare as instants; other strings compare lexically.
    #[must_use]
    pub fn column_lt(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            column: column.to_owned(),
            comparison: Comparison::Lt,
            value: value.into(),
        });
        self
    }

    /// Conditions in insertion order.
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Evaluate the filter against a row.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|condition| {
            let Some(actual) = record.get(&condition.column) else {
                return false;
            };
            match condition.comparison {
                Comparison::Eq => actual == &condition.value,
                Comparison::Lt => {
                    compare_values(actual, &condition.value) == Some(Ordering::Less)
                }
            }
        })
    }
}

pub(crate) fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => {
            match (
                a.parse::<DateTime<Utc>>().ok(),
                b.parse::<DateTime<Utc>>().ok(),
            ) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => Some(a.cmp(b)),
            }
        }
        _ => None,
    }
}

/// Result ordering for [`RemoteStore::select_where`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    #[must_use]
    pub fn ascending(column: &str) -> Self {
        Self {
            column: column.to_owned(),
            descending: false,
        }
    }

    #[must_use]
    pub fn descending(column: &str) -> Self {
        Self {
            column: column.to_owned(),
            descending: true,
        }
    }
}

/// Kind of row change carried by a push notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
}

/// Push notification for a watched row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub new_row: Option<Record>,
    pub old_row: Option<Record>,
}

impl ChangeEvent {
    /// The row image relevant to the change: the new image when present,
    /// otherwise the old one.
    #[must_use]
    pub fn row(&self) -> Option<&Record> {
        self.new_row.as_ref().or(self.old_row.as_ref())
    }
}

/// Which changes a subscription receives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    /// Restrict to one change kind; `None` receives all kinds.
    pub kind: Option<ChangeKind>,
    /// Row predicate evaluated against the relevant row image.
    pub rows: Filter,
}

impl EventFilter {
    /// Receive every change on the table.
    #[must_use]
    pub fn everything() -> Self {
        Self::default()
    }

    /// Receive only changes of one kind.
    #[must_use]
    pub fn only(kind: ChangeKind) -> Self {
        Self {
            kind: Some(kind),
            rows: Filter::all(),
        }
    }

    /// Restrict to rows matching `rows`.
    #[must_use]
    pub fn with_rows(mut self, rows: Filter) -> Self {
        self.rows = rows;
        self
    }

    /// Evaluate the filter against a change.
    #[must_use]
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        if self.kind.is_some_and(|kind| kind != event.kind) {
            return false;
        }
        event.row().is_some_and(|row| self.rows.matches(row))
    }
}

/// Opaque handle identifying a live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(pub u64);

/// Atomic server-side procedures exposed by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Procedure {
    /// Args `{participant_id, x, y}`; returns the updated row.
    UpdatePosition,
    /// Args `{handle, last_seen}`; requires the service credential.
    MarkOffline,
    /// Args `{follower_id, followee_id}`; returns `{mutual: bool}`.
    Follow,
    /// Args `{participant_id}`; returns `[{friend_id, handle}]`.
    MutualFriends,
    /// Args `{a, b}`; returns `bool`.
    CheckFriendship,
    /// No args; moves every participant back to its origin.
    ResetPositions,
}

impl Procedure {
    /// Storage name of the procedure.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::UpdatePosition => "update_participant_position",
            Self::MarkOffline => "mark_participant_offline",
            Self::Follow => "follow_participant",
            Self::MutualFriends => "mutual_friends",
            Self::CheckFriendship => "check_friendship",
            Self::ResetPositions => "reset_participant_positions",
        }
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Port for the shared backend of record.
///
/// Every call runs under the credential the adapter was built with; the
/// elevated service credential is a separate adapter instance.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert a row, or merge `values` into the row whose `key_columns`
    /// match. Returns the stored row.
    async fn upsert_row(
        &self,
        table: Table,
        key_columns: &[&'static str],
        values: Record,
    ) -> Result<Record, RemoteStoreError>;

    /// Insert a new row, assigning an `id` when absent. Returns the stored row.
    async fn insert_row(&self, table: Table, values: Record) -> Result<Record, RemoteStoreError>;

    /// Merge `values` into every row matching `filter`; returns the number of
    /// affected rows.
    async fn update_where(
        &self,
        table: Table,
        filter: &Filter,
        values: Record,
    ) -> Result<u64, RemoteStoreError>;

    /// Delete every row matching `filter`; returns the number of removed rows.
    async fn delete_where(&self, table: Table, filter: &Filter) -> Result<u64, RemoteStoreError>;

    /// Read every row matching `filter`.
    async fn select_where(
        &self,
        table: Table,
        filter: &Filter,
        order: Option<OrderBy>,
    ) -> Result<Vec<Record>, RemoteStoreError>;

    /// Invoke an atomic server-side procedure.
    async fn call_procedure(
        &self,
        procedure: Procedure,
        args: Value,
    ) -> Result<Value, RemoteStoreError>;

    /// Deliver changes on `table` accepted by `filter` into `sink` until the
    /// returned handle is released.
    fn subscribe(
        &self,
        table: Table,
        filter: EventFilter,
        sink: mpsc::UnboundedSender<ChangeEvent>,
    ) -> Result<SubscriptionHandle, RemoteStoreError>;

    /// Release a subscription. Releasing an unknown handle is an error.
    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), RemoteStoreError>;
}
