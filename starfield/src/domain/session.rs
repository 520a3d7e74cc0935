//! Session values produced by the identity provider.

use chrono::{DateTime, Utc};

use crate::domain::{Handle, ParticipantId};

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub participant_id: ParticipantId,
    pub handle: Handle,
    /// Seeds the per-session drift vector.
    pub started_at: DateTime<Utc>,
}

/// Session transition broadcast by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn(Session),
    SignedOut,
}
