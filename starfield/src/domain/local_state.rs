//! Everything one client believes about the shared world.

use std::time::Duration;

use crate::domain::{ChatLog, GlowBoard, ParticipantId, ParticipantView, RoomDirectory};

/// Client-side state, mutated only by the owning event loop.
#[derive(Debug, Clone)]
pub struct LocalState {
    pub participants: ParticipantView,
    pub rooms: RoomDirectory,
    pub chat: ChatLog,
    pub glows: GlowBoard,
}

impl LocalState {
    #[must_use]
    pub fn new(message_retention: Duration, glow_lifetime: Duration) -> Self {
        Self {
            participants: ParticipantView::new(),
            rooms: RoomDirectory::new(),
            chat: ChatLog::new(message_retention),
            glows: GlowBoard::new(glow_lifetime),
        }
    }

    /// The signed-in participant, if any.
    #[must_use]
    pub fn me(&self) -> Option<ParticipantId> {
        self.participants.local_id()
    }

    /// Forget session-scoped state after sign-out. Participants and rooms
    /// stay visible.
    pub fn reset_session(&mut self) {
        self.participants.set_local(None);
        self.rooms.set_affiliation(crate::domain::Affiliation::Unaffiliated);
        self.rooms.forget_echoes();
        self.chat.clear();
        self.glows.clear();
    }
}
