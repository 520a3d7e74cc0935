//! Single funnel for push notifications and periodic refreshes.
//!
//! Pushes and full refreshes are independent correction paths. Both land
//! here and become the same idempotent upserts and removals, keyed by stable
//! id. A client's own writes echo back as ordinary pushes and are absorbed
//! the same way. Own membership writes are matched against the directory's
//! pending echoes, so a late echo never reads as a kick. After teardown
//! every subscription is released and any event still queued is dropped
//! instead of applied.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::participant_view::ViewChange;
use crate::domain::ports::{
    ChangeEvent, ChangeKind, EventFilter, Filter, OrderBy, Record, RemoteStore, SubscriptionHandle,
    Table,
};
use crate::domain::records::{columns, decode, decode_all};
use crate::domain::{
    Affiliation, ChatChannel, ChatMessage, Error, FriendshipGlow, LocalState, Membership,
    MembershipEcho, ParticipantId, ParticipantRow, Room, RoomId,
};

/// What applying one event did to local state.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Participant(ParticipantId, ViewChange),
    ParticipantRemoved(ParticipantId),
    Room(RoomId),
    RoomRemoved(RoomId),
    /// Some membership changed; the room listing is stale.
    MembershipChanged,
    /// The local participant's membership was deleted by someone else.
    Kicked(RoomId),
    Glow(FriendshipGlow),
    Message(ChatMessage),
    /// Valid but irrelevant to this client.
    Ignored,
    /// Arrived after teardown, or could not be decoded.
    Discarded,
}

/// Owns push subscriptions and normalises their events.
pub struct Reconciler<S> {
    store: Arc<S>,
    sink: mpsc::UnboundedSender<ChangeEvent>,
    handles: Vec<SubscriptionHandle>,
    active: bool,
}

impl<S> Reconciler<S> {
    /// Pushes are delivered into `sink`; the owner drains the paired
    /// receiver and feeds each event back through [`Reconciler::apply`].
    pub fn new(store: Arc<S>, sink: mpsc::UnboundedSender<ChangeEvent>) -> Self {
        Self {
            store,
            sink,
            handles: Vec::new(),
            active: false,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.handles.len()
    }

    /// Fold one pushed change into local state.
    pub fn apply(&self, event: &ChangeEvent, state: &mut LocalState, now: DateTime<Utc>) -> Applied {
        if !self.active {
            debug!(table = %event.table, "discarding push received after teardown");
            return Applied::Discarded;
        }
        let result = match event.table {
            Table::Participants => apply_participant(event, state),
            Table::Rooms => apply_room(event, state),
            Table::Memberships => apply_membership(event, state),
            Table::FriendshipEvents => apply_friendship(event, state, now),
            Table::PublicMessages | Table::RoomMessages | Table::PrivateMessages => {
                apply_message(event, state, now)
            }
            Table::Bans | Table::Follows => Ok(Applied::Ignored),
        };
        result.unwrap_or_else(|error| {
            warn!(table = %event.table, error = %error, "dropping malformed push");
            Applied::Discarded
        })
    }
}

impl<S> Reconciler<S>
where
    S: RemoteStore,
{
    /// Watch every table the client renders. A table that cannot be watched
    /// is logged and skipped; the periodic refresh still covers it.
    pub fn subscribe_all(&mut self, me: ParticipantId) -> usize {
        let watched = [
            (Table::Participants, EventFilter::everything()),
            (Table::Rooms, EventFilter::everything()),
            (Table::Memberships, EventFilter::everything()),
            (Table::FriendshipEvents, EventFilter::only(ChangeKind::Inserted)),
            (Table::PublicMessages, EventFilter::only(ChangeKind::Inserted)),
            (Table::RoomMessages, EventFilter::only(ChangeKind::Inserted)),
            (
                Table::PrivateMessages,
                EventFilter::only(ChangeKind::Inserted)
                    .with_rows(Filter::all().column_eq(columns::RECEIVER_ID, me)),
            ),
        ];
        self.active = true;
        for (table, filter) in watched {
            match self.store.subscribe(table, filter, self.sink.clone()) {
                Ok(handle) => self.handles.push(handle),
                Err(error) => warn!(%table, error = %error, "subscription failed"),
            }
        }
        debug!(count = self.handles.len(), "subscriptions established");
        self.handles.len()
    }

    /// Release every subscription. All handles are attempted; the first
    /// failure is returned.
    pub fn release_all(&mut self) -> Result<(), Error> {
        self.active = false;
        let mut first_error = None;
        for handle in self.handles.drain(..) {
            if let Err(error) = self.store.unsubscribe(handle) {
                warn!(handle = handle.0, error = %error, "unsubscribe failed");
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), |error| Err(Error::from(error)))
    }

    /// Replace the participant list with the store's.
    pub async fn refresh_participants(&self, state: &mut LocalState) -> Result<usize, Error> {
        let rows = self
            .store
            .select_where(Table::Participants, &Filter::all(), None)
            .await?;
        let decoded: Vec<ParticipantRow> = decode_all(Table::Participants, &rows);
        for error in state.participants.replace_all(&decoded) {
            warn!(error = %error, "skipping invalid participant row");
        }
        Ok(state.participants.len())
    }

    /// Replace the room listing with the store's and re-read affiliation.
    pub async fn refresh_rooms(&self, state: &mut LocalState) -> Result<usize, Error> {
        let rows = self
            .store
            .select_where(
                Table::Rooms,
                &Filter::all(),
                Some(OrderBy::descending(columns::CREATED_AT)),
            )
            .await?;
        let rooms: Vec<Room> = decode_all(Table::Rooms, &rows);
        let count = rooms.len();
        state.rooms.replace_all(rooms);

        if let Some(me) = state.me() {
            let memberships = self
                .store
                .select_where(
                    Table::Memberships,
                    &Filter::all().column_eq(columns::PARTICIPANT_ID, me),
                    None,
                )
                .await?;
            let mine: Vec<Membership> = decode_all(Table::Memberships, &memberships);
            let affiliation = mine
                .first()
                .map_or(Affiliation::Unaffiliated, |m| Affiliation::Member(m.room_id));
            if let (Affiliation::Member(old), Affiliation::Unaffiliated) =
                (state.rooms.affiliation(), affiliation)
            {
                state.chat.clear_room(old);
            }
            state.rooms.set_affiliation(affiliation);
        }
        Ok(count)
    }
}

fn new_row(event: &ChangeEvent) -> Result<&Record, Error> {
    event
        .new_row
        .as_ref()
        .ok_or_else(|| Error::internal(format!("{} push without new row", event.table)))
}

fn old_row(event: &ChangeEvent) -> Result<&Record, Error> {
    event
        .row()
        .ok_or_else(|| Error::internal(format!("{} push without row image", event.table)))
}

fn apply_participant(event: &ChangeEvent, state: &mut LocalState) -> Result<Applied, Error> {
    if event.kind == ChangeKind::Deleted {
        let row: ParticipantRow = decode(Table::Participants, old_row(event)?)?;
        let Some(id) = row.id else {
            return Ok(Applied::Ignored);
        };
        state.participants.remove(id);
        return Ok(Applied::ParticipantRemoved(id));
    }
    let row: ParticipantRow = decode(Table::Participants, new_row(event)?)?;
    let change = state
        .participants
        .upsert_row(&row)
        .map_err(|err| Error::invalid_request(err.to_string()))?;
    match row.id {
        Some(id) => Ok(Applied::Participant(id, change)),
        None => Ok(Applied::Ignored),
    }
}

fn apply_room(event: &ChangeEvent, state: &mut LocalState) -> Result<Applied, Error> {
    if event.kind == ChangeKind::Deleted {
        let row = old_row(event)?;
        let id: RoomId = row
            .get(columns::ID)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| Error::internal(format!("room push with bad id: {err}")))?
            .ok_or_else(|| Error::internal("room push without id"))?;
        state.rooms.remove(id);
        state.chat.clear_room(id);
        return Ok(Applied::RoomRemoved(id));
    }
    let room: Room = decode(Table::Rooms, new_row(event)?)?;
    let id = room.id;
    state.rooms.upsert(room);
    Ok(Applied::Room(id))
}

fn apply_membership(event: &ChangeEvent, state: &mut LocalState) -> Result<Applied, Error> {
    state.rooms.mark_stale();
    let Some(me) = state.me() else {
        return Ok(Applied::MembershipChanged);
    };
    let membership: Membership = decode(Table::Memberships, old_row(event)?)?;
    if membership.participant_id != me {
        return Ok(Applied::MembershipChanged);
    }
    let room = membership.room_id;
    let current = state.rooms.affiliation();
    match event.kind {
        ChangeKind::Inserted | ChangeKind::Updated => {
            // Local affiliation already reflects our own writes; a foreign
            // row only fills an empty slot and the refresh settles the rest.
            if !state.rooms.take_echo(MembershipEcho::Joined(room))
                && current == Affiliation::Unaffiliated
            {
                state.rooms.set_affiliation(Affiliation::Member(room));
            }
            Ok(Applied::MembershipChanged)
        }
        ChangeKind::Deleted => {
            if state.rooms.take_echo(MembershipEcho::Left(room))
                || current != Affiliation::Member(room)
            {
                return Ok(Applied::MembershipChanged);
            }
            state.rooms.set_affiliation(Affiliation::Unaffiliated);
            state.chat.clear_room(room);
            Ok(Applied::Kicked(room))
        }
    }
}

fn apply_friendship(
    event: &ChangeEvent,
    state: &mut LocalState,
    now: DateTime<Utc>,
) -> Result<Applied, Error> {
    if event.kind != ChangeKind::Inserted {
        return Ok(Applied::Ignored);
    }
    let glow = state.glows.ingest(new_row(event)?, now)?;
    Ok(Applied::Glow(glow))
}

fn apply_message(
    event: &ChangeEvent,
    state: &mut LocalState,
    now: DateTime<Utc>,
) -> Result<Applied, Error> {
    if event.kind != ChangeKind::Inserted {
        return Ok(Applied::Ignored);
    }
    let message = ChatMessage::from_row(event.table, new_row(event)?)?;
    let relevant = match message.channel {
        ChatChannel::Public => true,
        ChatChannel::Room(room) => state.rooms.affiliation() == Affiliation::Member(room),
        ChatChannel::Private => state
            .me()
            .is_some_and(|me| message.receiver_id == Some(me) || message.sender_id == me),
    };
    if !relevant || !state.chat.ingest(message.clone(), now) {
        return Ok(Applied::Ignored);
    }
    Ok(Applied::Message(message))
}

#[cfg(test)]
#[path = "reconciliation_tests.rs"]
mod tests;
