//! Public, room and private chat.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use mockable::Clock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::domain::ports::{Filter, OrderBy, Procedure, Record, RemoteStore, Table};
use crate::domain::records::{columns, decode, record};
use crate::domain::{Affiliation, Error, Handle, ParticipantId, RoomId, Session};

/// Where a message was posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatChannel {
    Public,
    Room(RoomId),
    /// Between `sender` and `receiver` on the message itself.
    Private,
}

/// What produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    User,
    Join,
    Leave,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub channel: ChatChannel,
    pub kind: MessageKind,
    pub sender_id: ParticipantId,
    pub sender_handle: Option<String>,
    pub receiver_id: Option<ParticipantId>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct MessageRow {
    id: Uuid,
    sender_id: ParticipantId,
    #[serde(default)]
    sender_handle: Option<String>,
    #[serde(default)]
    receiver_id: Option<ParticipantId>,
    #[serde(default)]
    room_id: Option<RoomId>,
    #[serde(default)]
    kind: MessageKind,
    content: String,
    created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Decode a row from one of the three message tables.
    pub fn from_row(table: Table, row: &Record) -> Result<Self, Error> {
        let raw: MessageRow = decode(table, row)?;
        let channel = match table {
            Table::PublicMessages => ChatChannel::Public,
            Table::RoomMessages => ChatChannel::Room(
                raw.room_id
                    .ok_or_else(|| Error::internal("room message without room_id"))?,
            ),
            Table::PrivateMessages => ChatChannel::Private,
            other => return Err(Error::internal(format!("{other} does not hold messages"))),
        };
        Ok(Self {
            id: raw.id,
            channel,
            kind: raw.kind,
            sender_id: raw.sender_id,
            sender_handle: raw.sender_handle,
            receiver_id: raw.receiver_id,
            content: raw.content,
            created_at: raw.created_at,
        })
    }

    #[must_use]
    pub fn is_system(&self) -> bool {
        self.sender_id == ParticipantId::SYSTEM
    }

    /// Whether a private message is between `a` and `b`, either direction.
    #[must_use]
    pub fn is_between(&self, a: ParticipantId, b: ParticipantId) -> bool {
        let Some(receiver) = self.receiver_id else {
            return false;
        };
        (self.sender_id == a && receiver == b) || (self.sender_id == b && receiver == a)
    }
}

/// Trim and validate outgoing content.
pub fn normalize_content(raw: &str) -> Result<String, Error> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_request("message must not be empty"));
    }
    Ok(trimmed.to_owned())
}

/// Messages received during this session, bounded by a retention window.
#[derive(Debug, Clone)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
    retention: TimeDelta,
}

impl ChatLog {
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            messages: Vec::new(),
            retention: TimeDelta::from_std(retention).unwrap_or_else(|_| TimeDelta::days(365)),
        }
    }

    /// Record a message unless it is older than the retention window or
    /// already present.
    pub fn ingest(&mut self, message: ChatMessage, now: DateTime<Utc>) -> bool {
        if now - message.created_at > self.retention {
            debug!(message_id = %message.id, "ignoring message outside retention window");
            return false;
        }
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        let index = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(index, message);
        true
    }

    /// Drop messages older than the retention window.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let retention = self.retention;
        self.messages.retain(|m| now - m.created_at <= retention);
    }

    /// Forget every message of one room.
    pub fn clear_room(&mut self, room: RoomId) {
        self.messages.retain(|m| m.channel != ChatChannel::Room(room));
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn channel(&self, channel: ChatChannel) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(move |m| m.channel == channel)
    }

    pub fn conversation(
        &self,
        me: ParticipantId,
        peer: ParticipantId,
    ) -> impl Iterator<Item = &ChatMessage> {
        self.messages
            .iter()
            .filter(move |m| m.channel == ChatChannel::Private && m.is_between(me, peer))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Sends messages and maintains the public log.
#[derive(Clone)]
pub struct ChatService<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> ChatService<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

impl<S> ChatService<S>
where
    S: RemoteStore,
{
    pub async fn send_public(&self, sender: &Session, content: &str) -> Result<ChatMessage, Error> {
        let content = normalize_content(content)?;
        let row = record(json!({
            "id": Uuid::new_v4(),
            "sender_id": sender.participant_id,
            "sender_handle": sender.handle,
            "content": content,
            "kind": MessageKind::User,
            "created_at": self.clock.utc(),
        }));
        self.insert(Table::PublicMessages, row).await
    }

    /// Post to the sender's current room.
    pub async fn send_room(
        &self,
        sender: &Session,
        affiliation: Affiliation,
        room: RoomId,
        content: &str,
    ) -> Result<ChatMessage, Error> {
        let content = normalize_content(content)?;
        if affiliation != Affiliation::Member(room) {
            return Err(Error::permission_denied("join the room before posting to it"));
        }
        let row = record(json!({
            "id": Uuid::new_v4(),
            "room_id": room,
            "sender_id": sender.participant_id,
            "sender_handle": sender.handle,
            "content": content,
            "created_at": self.clock.utc(),
        }));
        self.insert(Table::RoomMessages, row).await
    }

    /// Send a private message. Only mutual friends may message each other.
    pub async fn send_private(
        &self,
        sender: &Session,
        receiver: ParticipantId,
        content: &str,
    ) -> Result<ChatMessage, Error> {
        let content = normalize_content(content)?;
        let friends = self
            .store
            .call_procedure(
                Procedure::CheckFriendship,
                json!({ "a": sender.participant_id, "b": receiver }),
            )
            .await?;
        if friends.as_bool() != Some(true) {
            return Err(Error::permission_denied(
                "private messages are limited to mutual friends",
            ));
        }
        let row = record(json!({
            "id": Uuid::new_v4(),
            "sender_id": sender.participant_id,
            "receiver_id": receiver,
            "content": content,
            "created_at": self.clock.utc(),
        }));
        self.insert(Table::PrivateMessages, row).await
    }

    /// Post a system announcement about `handle` in the public channel.
    pub async fn announce(&self, kind: MessageKind, handle: &Handle) -> Result<ChatMessage, Error> {
        let content = match kind {
            MessageKind::Join => format!("{handle} joined"),
            MessageKind::Leave => format!("{handle} left"),
            MessageKind::User => {
                return Err(Error::invalid_request(
                    "announcements need a join or leave kind",
                ));
            }
        };
        let row = record(json!({
            "id": Uuid::new_v4(),
            "sender_id": ParticipantId::SYSTEM,
            "sender_handle": Handle::system(),
            "content": content,
            "kind": kind,
            "created_at": self.clock.utc(),
        }));
        self.insert(Table::PublicMessages, row).await
    }

    /// Delete public messages older than `max_age`.
    pub async fn purge_public(&self, max_age: Duration) -> Result<u64, Error> {
        let age = TimeDelta::from_std(max_age)
            .map_err(|err| Error::invalid_request(format!("purge age out of range: {err}")))?;
        let cutoff = self.clock.utc() - age;
        let removed = self
            .store
            .delete_where(
                Table::PublicMessages,
                &Filter::all().column_lt(columns::CREATED_AT, cutoff.to_rfc3339()),
            )
            .await?;
        debug!(removed, %cutoff, "purged public messages");
        Ok(removed)
    }

    /// Load recent public history into `log`.
    pub async fn load_public_history(&self, log: &mut ChatLog) -> Result<usize, Error> {
        self.load_into(Table::PublicMessages, Filter::all(), log).await
    }

    /// Load recent history of one room into `log`.
    pub async fn load_room_history(&self, room: RoomId, log: &mut ChatLog) -> Result<usize, Error> {
        self.load_into(
            Table::RoomMessages,
            Filter::all().column_eq(columns::ROOM_ID, room),
            log,
        )
        .await
    }

    async fn load_into(&self, table: Table, filter: Filter, log: &mut ChatLog) -> Result<usize, Error> {
        let rows = self
            .store
            .select_where(table, &filter, Some(OrderBy::ascending(columns::CREATED_AT)))
            .await?;
        let now = self.clock.utc();
        let mut loaded = 0;
        for row in &rows {
            match ChatMessage::from_row(table, row) {
                Ok(message) => {
                    if log.ingest(message, now) {
                        loaded += 1;
                    }
                }
                Err(error) => tracing::warn!(%table, error = %error, "skipping malformed message"),
            }
        }
        Ok(loaded)
    }

    async fn insert(&self, table: Table, row: Record) -> Result<ChatMessage, Error> {
        let stored = self.store.insert_row(table, row).await?;
        ChatMessage::from_row(table, &stored)
    }
}
