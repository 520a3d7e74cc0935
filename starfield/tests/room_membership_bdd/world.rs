//! Scenario-world methods for room membership BDD tests.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use starfield::domain::{Error, ParticipantId, Room, RoomId};
use starfield::test_support::{TestWorld, quiet_settings};
use tokio::runtime::Runtime;

use crate::{Member, RoomMembershipWorld, RuntimeHandle, support};

impl RoomMembershipWorld {
    /// Start a runtime and sign in one client per name.
    pub fn sign_in_all(&self, names: &[&str]) {
        let runtime = Arc::new(Runtime::new().expect("create runtime"));
        let shared = Arc::new(TestWorld::new());
        let members = runtime.block_on(async {
            let mut members = BTreeMap::new();
            for name in names {
                let mut client = shared.client(quiet_settings());
                let session = client.sign_in(name).await;
                members.insert(
                    (*name).to_owned(),
                    Member {
                        client: Arc::new(client),
                        session,
                    },
                );
            }
            members
        });
        self.runtime.set(RuntimeHandle(runtime));
        self.shared.set(shared);
        self.members.set(members);
        self.rooms.set(BTreeMap::new());
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let runtime = self.runtime.get().expect("runtime should be set");
        runtime.0.block_on(future)
    }

    pub fn member(&self, name: &str) -> Member {
        self.members
            .get()
            .expect("participants should be signed in")
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("no participant named {name}"))
    }

    pub fn participant(&self, name: &str) -> ParticipantId {
        self.member(name).session.participant_id
    }

    /// The room most recently opened by `owner`.
    pub fn room_of(&self, owner: &str) -> RoomId {
        self.rooms
            .get()
            .expect("room map should be set")
            .get(owner)
            .copied()
            .unwrap_or_else(|| panic!("{owner} has not opened a room"))
    }

    pub fn open_room(&self, owner: &str, capacity: u32) {
        let member = self.member(owner);
        let name = format!("{owner}'s room");
        let room = self
            .block_on(member.client.handle.create_room(&name, Some(capacity)))
            .expect("room should be created");
        let mut rooms = self.rooms.get().unwrap_or_default();
        rooms.insert(owner.to_owned(), room.id);
        self.rooms.set(rooms);
    }

    pub fn join(&self, name: &str, owner: &str) {
        let room = self.room_of(owner);
        let member = self.member(name);
        self.block_on(member.client.handle.join_room(room))
            .expect("join should succeed");
    }

    /// Attempt a join that is expected to fail and keep the error.
    pub fn attempt_join(&self, name: &str, owner: &str) {
        let room = self.room_of(owner);
        let member = self.member(name);
        let error = self
            .block_on(member.client.handle.join_room(room))
            .expect_err("join should be refused");
        self.last_error.set(error);
    }

    pub fn last_error(&self) -> Error {
        self.last_error.get().expect("a refusal should be recorded")
    }

    pub fn room_row(&self, room: RoomId) -> Room {
        support::room_rows(&self.shared().backend)
            .into_iter()
            .find(|candidate| candidate.id == room)
            .expect("room row should exist")
    }

    /// Cached occupant count alongside the true number of membership rows.
    pub fn occupancy(&self, room: RoomId) -> (u32, usize) {
        support::occupancy(&self.shared().backend, room)
    }

    /// Rooms `name` holds a membership row for.
    pub fn rooms_joined_by(&self, name: &str) -> Vec<RoomId> {
        let participant = self.participant(name);
        support::membership_pairs(&self.shared().backend)
            .into_iter()
            .filter(|(who, _)| *who == participant)
            .map(|(_, room)| room)
            .collect()
    }

    fn shared(&self) -> Arc<TestWorld> {
        self.shared.get().expect("shared backend should be set")
    }
}
