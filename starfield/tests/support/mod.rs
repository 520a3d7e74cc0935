//! Readers over the in-memory backend shared by integration tests.

use serde_json::Value;
use starfield::domain::ports::Table;
use starfield::domain::{ParticipantId, Room, RoomId};
use starfield::outbound::memory::InMemoryBackend;

/// Every membership row as `(participant, room)`.
pub fn membership_pairs(backend: &InMemoryBackend) -> Vec<(ParticipantId, RoomId)> {
    backend
        .dump(Table::Memberships)
        .expect("dump memberships")
        .into_iter()
        .map(|row| {
            let field = |column: &str| row.get(column).cloned().unwrap_or(Value::Null);
            let participant =
                serde_json::from_value(field("participant_id")).expect("participant id");
            let room = serde_json::from_value(field("room_id")).expect("room id");
            (participant, room)
        })
        .collect()
}

/// Every room row, decoded.
pub fn room_rows(backend: &InMemoryBackend) -> Vec<Room> {
    backend
        .dump(Table::Rooms)
        .expect("dump rooms")
        .into_iter()
        .map(|row| serde_json::from_value(Value::Object(row)).expect("room row"))
        .collect()
}

/// Cached occupant count alongside the true number of membership rows.
pub fn occupancy(backend: &InMemoryBackend, room: RoomId) -> (u32, usize) {
    let cached = room_rows(backend)
        .into_iter()
        .find(|candidate| candidate.id == room)
        .map(|candidate| candidate.occupant_count)
        .expect("room row should exist");
    let actual = membership_pairs(backend)
        .into_iter()
        .filter(|(_, in_room)| *in_room == room)
        .count();
    (cached, actual)
}
