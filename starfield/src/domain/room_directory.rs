//! Local cache of the room listing and the caller's affiliation.

use std::collections::VecDeque;

use crate::domain::{Affiliation, Room, RoomId};

/// Own membership writes remembered while their pushes are outstanding.
const MAX_PENDING_ECHOES: usize = 64;

/// A membership write this client made itself and expects to see pushed
/// back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEcho {
    Joined(RoomId),
    Left(RoomId),
}

/// Rooms known to this client, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomDirectory {
    rooms: Vec<Room>,
    affiliation: Affiliation,
    stale: bool,
    pending_echoes: VecDeque<MembershipEcho>,
}

impl RoomDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rooms(&self) -> &[Room] {
        &self.rooms
    }

    #[must_use]
    pub fn get(&self, id: RoomId) -> Option<&Room> {
        self.rooms.iter().find(|room| room.id == id)
    }

    #[must_use]
    pub fn affiliation(&self) -> Affiliation {
        self.affiliation
    }

    pub fn set_affiliation(&mut self, affiliation: Affiliation) {
        if self.affiliation != affiliation {
            tracing::debug!(?affiliation, "affiliation changed");
        }
        self.affiliation = affiliation;
    }

    /// Insert or replace a room, keeping newest-first order.
    pub fn upsert(&mut self, room: Room) {
        match self.rooms.iter_mut().find(|r| r.id == room.id) {
            Some(existing) => *existing = room,
            None => self.rooms.push(room),
        }
        self.sort();
    }

    pub fn remove(&mut self, id: RoomId) -> bool {
        let before = self.rooms.len();
        self.rooms.retain(|room| room.id != id);
        if self.affiliation == Affiliation::Member(id) {
            self.affiliation = Affiliation::Unaffiliated;
        }
        self.rooms.len() != before
    }

    /// Replace the listing with a full fetch and clear the stale flag.
    pub fn replace_all(&mut self, rooms: Vec<Room>) {
        self.rooms = rooms;
        self.sort();
        self.stale = false;
    }

    /// Update the cached count of one room.
    pub fn set_occupant_count(&mut self, id: RoomId, count: u32) {
        if let Some(room) = self.rooms.iter_mut().find(|room| room.id == id) {
            room.occupant_count = count;
        }
    }

    /// Remember a membership write whose push has not arrived yet. The
    /// oldest entry is forgotten once the queue is full.
    pub fn expect_echo(&mut self, echo: MembershipEcho) {
        if self.pending_echoes.len() == MAX_PENDING_ECHOES {
            self.pending_echoes.pop_front();
        }
        self.pending_echoes.push_back(echo);
    }

    /// Consume the oldest matching pending write. `false` means the push
    /// was not caused by this client.
    pub fn take_echo(&mut self, echo: MembershipEcho) -> bool {
        match self.pending_echoes.iter().position(|pending| *pending == echo) {
            Some(index) => self.pending_echoes.remove(index).is_some(),
            None => false,
        }
    }

    pub fn forget_echoes(&mut self) {
        self.pending_echoes.clear();
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    fn sort(&mut self) {
        self.rooms.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    }
}
