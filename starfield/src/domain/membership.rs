//! Room membership coordination.
//!
//! Every multi-step operation here runs against the shared store without a
//! lock, so other clients may interleave between steps. Occupant counts are
//! therefore never adjusted arithmetically: after any membership write the
//! affected room's count is rewritten from a fresh count of its membership
//! rows. Failed steps are not rolled back. A recount that fails or races
//! another one is caught by [`RoomCoordinator::reconcile_counts`], which
//! every room refresh runs, so a settled system converges on the store's
//! membership rows.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use mockable::Clock;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::domain::ports::{Filter, OrderBy, RemoteStore, Table};
use crate::domain::records::{columns, decode, decode_all, record};
use crate::domain::{
    Affiliation, Ban, BanId, Error, Membership, MembershipEcho, ParticipantId, Room,
    RoomDirectory, RoomDraft, RoomId, Visibility,
};

/// Reason stored on bans issued without one.
pub const DEFAULT_BAN_REASON: &str = "Removed by room owner";

/// Coordinates room creation, joins, moderation and ownership.
#[derive(Clone)]
pub struct RoomCoordinator<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> RoomCoordinator<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

impl<S> RoomCoordinator<S>
where
    S: RemoteStore,
{
    /// Create a room owned by `actor` and move `actor` into it.
    ///
    /// An existing membership is left first. A failure after that point is
    /// reported as a partial sequence naming the rooms left. If the room is
    /// created but the membership insert fails, the room is kept and its
    /// count rewritten from its (empty) membership.
    pub async fn create(
        &self,
        actor: ParticipantId,
        draft: RoomDraft,
        directory: &mut RoomDirectory,
    ) -> Result<Room, Error> {
        let existing = self.memberships_of(actor).await?;
        let left = self.delete_memberships(actor, &existing, directory).await?;
        directory.set_affiliation(Affiliation::Unaffiliated);

        let room_id = RoomId::random();
        let row = record(json!({
            "id": room_id,
            "name": draft.name,
            "description": draft.description,
            "owner_id": actor,
            "capacity": draft.capacity,
            "occupant_count": 1,
            "visibility": draft.visibility,
            "created_at": self.clock.utc(),
        }));
        let stored = match self.store.insert_row(Table::Rooms, row).await {
            Ok(stored) => stored,
            Err(error) if left.is_empty() => return Err(Error::from(error)),
            Err(error) => {
                warn!(%actor, error = %error, "room creation failed after leaving previous room");
                return Err(Error::partial_sequence_failure(format!(
                    "left previous room but creating a room failed: {error}"
                ))
                .with_details(json!({ "leftRooms": left, "step": "insert_room" })));
            }
        };
        let room: Room = decode(Table::Rooms, &stored)?;
        directory.upsert(room.clone());
        debug!(room_id = %room.id, owner = %actor, "room created");

        if let Err(error) = self.insert_membership(actor, room.id).await {
            warn!(room_id = %room.id, error = %error, "room created without its owner's membership");
            self.recount_logged(room.id, directory).await;
            return Err(Error::partial_sequence_failure(format!(
                "room created but joining it failed: {error}"
            ))
            .with_details(json!({
                "roomId": room.id,
                "leftRooms": left,
                "step": "insert_membership",
            })));
        }
        directory.expect_echo(MembershipEcho::Joined(room.id));
        directory.set_affiliation(Affiliation::Member(room.id));
        Ok(room)
    }

    /// Move `actor` into `room_id`, leaving any current room first.
    ///
    /// Ban and capacity are checked before anything is written, so a
    /// rejected join leaves the caller where it was. The capacity check reads
    /// the cached count and is advisory: concurrent joiners can overshoot.
    pub async fn join(
        &self,
        actor: ParticipantId,
        room_id: RoomId,
        directory: &mut RoomDirectory,
    ) -> Result<(), Error> {
        let existing = self.memberships_of(actor).await?;
        if existing.iter().any(|m| m.room_id == room_id) {
            directory.set_affiliation(Affiliation::Member(room_id));
            return Ok(());
        }

        if self.is_banned(actor, room_id).await? {
            return Err(Error::permission_denied("you are banned from this room")
                .with_details(json!({ "roomId": room_id })));
        }

        let room = self.fetch_room(room_id).await?;
        directory.upsert(room.clone());
        if !room.has_space() {
            return Err(Error::capacity_exceeded(format!(
                "room {} is full ({}/{})",
                room.name, room.occupant_count, room.capacity
            ))
            .with_details(json!({ "roomId": room_id, "capacity": room.capacity })));
        }

        let left = self.delete_memberships(actor, &existing, directory).await?;

        if let Err(error) = self.insert_membership(actor, room_id).await {
            if left.is_empty() {
                return Err(error);
            }
            warn!(%actor, room_id = %room_id, error = %error, "join failed after leaving previous room");
            return Err(Error::partial_sequence_failure(format!(
                "left previous room but joining failed: {error}"
            ))
            .with_details(json!({ "roomId": room_id, "leftRooms": left, "step": "insert_membership" })));
        }
        directory.expect_echo(MembershipEcho::Joined(room_id));
        directory.set_affiliation(Affiliation::Member(room_id));
        self.recount_logged(room_id, directory).await;
        debug!(%actor, room_id = %room_id, "joined room");
        Ok(())
    }

    /// Leave the current room, if any. Returns the room that was left.
    pub async fn leave(
        &self,
        actor: ParticipantId,
        directory: &mut RoomDirectory,
    ) -> Result<Option<RoomId>, Error> {
        let existing = self.memberships_of(actor).await?;
        let left = self.delete_memberships(actor, &existing, directory).await?;
        directory.set_affiliation(Affiliation::Unaffiliated);
        Ok(left.into_iter().next())
    }

    /// Remove `target` from the actor's current room. Owner only.
    pub async fn kick(
        &self,
        actor: ParticipantId,
        target: ParticipantId,
        directory: &mut RoomDirectory,
    ) -> Result<RoomId, Error> {
        if actor == target {
            return Err(Error::invalid_request("owners cannot remove themselves"));
        }
        let room = self.owned_current_room(actor, directory).await?;

        let filter = Filter::all()
            .column_eq(columns::PARTICIPANT_ID, target)
            .column_eq(columns::ROOM_ID, room.id);
        let removed = self.store.delete_where(Table::Memberships, &filter).await?;
        if removed == 0 {
            return Err(Error::not_found("participant is not in this room")
                .with_details(json!({ "participantId": target, "roomId": room.id })));
        }
        self.recount_logged(room.id, directory).await;
        debug!(%actor, %target, room_id = %room.id, "participant kicked");
        Ok(room.id)
    }

    /// Kick `target` and record a ban. Banning someone who already left the
    /// room still records the ban; repeated bans are not deduplicated.
    pub async fn ban(
        &self,
        actor: ParticipantId,
        target: ParticipantId,
        reason: Option<String>,
        directory: &mut RoomDirectory,
    ) -> Result<Ban, Error> {
        let room_id = match self.kick(actor, target, directory).await {
            Ok(room_id) => room_id,
            Err(error) if error.code() == crate::domain::ErrorCode::NotFound => {
                self.owned_current_room(actor, directory).await?.id
            }
            Err(error) => return Err(error),
        };

        let row = record(json!({
            "id": BanId::random(),
            "room_id": room_id,
            "banned_id": target,
            "banned_by": actor,
            "reason": reason.unwrap_or_else(|| DEFAULT_BAN_REASON.to_owned()),
            "created_at": self.clock.utc(),
        }));
        let stored = match self.store.insert_row(Table::Bans, row).await {
            Ok(stored) => stored,
            Err(error) => {
                warn!(%target, room_id = %room_id, error = %error, "kicked but ban insert failed");
                return Err(Error::partial_sequence_failure(format!(
                    "participant removed but ban was not recorded: {error}"
                ))
                .with_details(json!({ "roomId": room_id, "step": "insert_ban" })));
            }
        };
        decode(Table::Bans, &stored)
    }

    /// Revoke a ban. Only the owner of the banned room may do so; the
    /// participant is not readmitted.
    pub async fn unban(&self, actor: ParticipantId, ban_id: BanId) -> Result<(), Error> {
        let rows = self
            .store
            .select_where(Table::Bans, &Filter::all().column_eq(columns::ID, ban_id), None)
            .await?;
        let Some(row) = rows.first() else {
            return Err(Error::not_found(format!("ban {ban_id} not found")));
        };
        let ban: Ban = decode(Table::Bans, row)?;
        let room = self.fetch_room(ban.room_id).await?;
        if room.owner != actor {
            return Err(Error::permission_denied("only the room owner can lift bans"));
        }
        self.store
            .delete_where(Table::Bans, &Filter::all().column_eq(columns::ID, ban_id))
            .await?;
        debug!(%actor, %ban_id, "ban lifted");
        Ok(())
    }

    /// Hand the actor's current room to another member. Only the owner
    /// column changes.
    pub async fn transfer_ownership(
        &self,
        actor: ParticipantId,
        new_owner: ParticipantId,
        directory: &mut RoomDirectory,
    ) -> Result<(), Error> {
        if actor == new_owner {
            return Err(Error::invalid_request("you already own this room"));
        }
        let mut room = self.owned_current_room(actor, directory).await?;
        let filter = Filter::all()
            .column_eq(columns::PARTICIPANT_ID, new_owner)
            .column_eq(columns::ROOM_ID, room.id);
        let is_member = !self
            .store
            .select_where(Table::Memberships, &filter, None)
            .await?
            .is_empty();
        if !is_member {
            return Err(Error::invalid_request("new owner must be in the room")
                .with_details(json!({ "participantId": new_owner })));
        }
        self.store
            .update_where(
                Table::Rooms,
                &Filter::all().column_eq(columns::ID, room.id),
                record(json!({ "owner_id": new_owner })),
            )
            .await?;
        room.owner = new_owner;
        directory.upsert(room);
        Ok(())
    }

    /// Every room, newest first.
    pub async fn fetch_rooms(&self) -> Result<Vec<Room>, Error> {
        let rows = self
            .store
            .select_where(
                Table::Rooms,
                &Filter::all(),
                Some(OrderBy::descending(columns::CREATED_AT)),
            )
            .await?;
        Ok(decode_all(Table::Rooms, &rows))
    }

    /// Public rooms, newest first.
    pub async fn list_public_rooms(&self) -> Result<Vec<Room>, Error> {
        let rows = self
            .store
            .select_where(
                Table::Rooms,
                &Filter::all().column_eq(columns::VISIBILITY, Visibility::Public.as_str()),
                Some(OrderBy::descending(columns::CREATED_AT)),
            )
            .await?;
        Ok(decode_all(Table::Rooms, &rows))
    }

    pub async fn members(&self, room_id: RoomId) -> Result<Vec<Membership>, Error> {
        let rows = self
            .store
            .select_where(
                Table::Memberships,
                &Filter::all().column_eq(columns::ROOM_ID, room_id),
                None,
            )
            .await?;
        Ok(decode_all(Table::Memberships, &rows))
    }

    pub async fn bans(&self, room_id: RoomId) -> Result<Vec<Ban>, Error> {
        let rows = self
            .store
            .select_where(
                Table::Bans,
                &Filter::all().column_eq(columns::ROOM_ID, room_id),
                Some(OrderBy::descending(columns::CREATED_AT)),
            )
            .await?;
        Ok(decode_all(Table::Bans, &rows))
    }

    /// Restore the caller's affiliation from the store.
    pub async fn refresh_affiliation(
        &self,
        actor: ParticipantId,
        directory: &mut RoomDirectory,
    ) -> Result<Affiliation, Error> {
        let affiliation = self
            .memberships_of(actor)
            .await?
            .first()
            .map_or(Affiliation::Unaffiliated, |m| Affiliation::Member(m.room_id));
        directory.set_affiliation(affiliation);
        Ok(affiliation)
    }

    /// Rewrite a room's cached count from its membership rows.
    pub async fn recount(&self, room_id: RoomId) -> Result<u32, Error> {
        let rows = self
            .store
            .select_where(
                Table::Memberships,
                &Filter::all().column_eq(columns::ROOM_ID, room_id),
                None,
            )
            .await?;
        let count = u32::try_from(rows.len()).unwrap_or(u32::MAX);
        self.store
            .update_where(
                Table::Rooms,
                &Filter::all().column_eq(columns::ID, room_id),
                record(json!({ "occupant_count": count })),
            )
            .await?;
        Ok(count)
    }

    /// Recount every room whose cached count disagrees with its membership
    /// rows and return the rooms corrected.
    pub async fn reconcile_counts(
        &self,
        directory: &mut RoomDirectory,
    ) -> Result<Vec<RoomId>, Error> {
        let rooms = self.fetch_rooms().await?;
        let rows = self
            .store
            .select_where(Table::Memberships, &Filter::all(), None)
            .await?;
        let memberships: Vec<Membership> = decode_all(Table::Memberships, &rows);
        let mut held: BTreeMap<RoomId, u32> = BTreeMap::new();
        for membership in &memberships {
            let count = held.entry(membership.room_id).or_default();
            *count = count.saturating_add(1);
        }

        let mut corrected = Vec::new();
        for room in rooms {
            let actual = held.get(&room.id).copied().unwrap_or_default();
            if room.occupant_count == actual {
                continue;
            }
            let count = self.recount(room.id).await?;
            directory.set_occupant_count(room.id, count);
            debug!(room_id = %room.id, was = room.occupant_count, count, "occupant count corrected");
            corrected.push(room.id);
        }
        Ok(corrected)
    }

    async fn recount_logged(&self, room_id: RoomId, directory: &mut RoomDirectory) {
        match self.recount(room_id).await {
            Ok(count) => directory.set_occupant_count(room_id, count),
            Err(error) => {
                warn!(room_id = %room_id, error = %error, "occupant recount failed");
            }
        }
    }

    async fn memberships_of(&self, actor: ParticipantId) -> Result<Vec<Membership>, Error> {
        let rows = self
            .store
            .select_where(
                Table::Memberships,
                &Filter::all().column_eq(columns::PARTICIPANT_ID, actor),
                None,
            )
            .await?;
        Ok(decode_all(Table::Memberships, &rows))
    }

    /// Delete every membership held by `actor` and recount the rooms left.
    async fn delete_memberships(
        &self,
        actor: ParticipantId,
        existing: &[Membership],
        directory: &mut RoomDirectory,
    ) -> Result<Vec<RoomId>, Error> {
        if existing.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .delete_where(
                Table::Memberships,
                &Filter::all().column_eq(columns::PARTICIPANT_ID, actor),
            )
            .await?;
        for membership in existing {
            directory.expect_echo(MembershipEcho::Left(membership.room_id));
        }
        directory.set_affiliation(Affiliation::Unaffiliated);
        let rooms: BTreeSet<RoomId> = existing.iter().map(|m| m.room_id).collect();
        for room_id in &rooms {
            self.recount_logged(*room_id, directory).await;
        }
        Ok(rooms.into_iter().collect())
    }

    async fn insert_membership(&self, actor: ParticipantId, room_id: RoomId) -> Result<(), Error> {
        let row = record(json!({
            "participant_id": actor,
            "room_id": room_id,
            "joined_at": self.clock.utc(),
        }));
        self.store.insert_row(Table::Memberships, row).await?;
        Ok(())
    }

    async fn is_banned(&self, actor: ParticipantId, room_id: RoomId) -> Result<bool, Error> {
        let filter = Filter::all()
            .column_eq(columns::ROOM_ID, room_id)
            .column_eq(columns::BANNED_ID, actor);
        Ok(!self
            .store
            .select_where(Table::Bans, &filter, None)
            .await?
            .is_empty())
    }

    async fn fetch_room(&self, room_id: RoomId) -> Result<Room, Error> {
        let rows = self
            .store
            .select_where(
                Table::Rooms,
                &Filter::all().column_eq(columns::ID, room_id),
                None,
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::not_found(format!("room {room_id} not found")))?;
        decode(Table::Rooms, row)
    }

    async fn owned_current_room(
        &self,
        actor: ParticipantId,
        directory: &RoomDirectory,
    ) -> Result<Room, Error> {
        let Some(room_id) = directory.affiliation().room() else {
            return Err(Error::invalid_request("you are not in a room"));
        };
        let room = self.fetch_room(room_id).await?;
        if room.owner != actor {
            return Err(Error::permission_denied("only the room owner can do that")
                .with_details(json!({ "roomId": room_id, "owner": Value::from(room.owner) })));
        }
        Ok(room)
    }
}

#[cfg(test)]
#[path = "membership_tests.rs"]
mod tests;
