//! Domain primitives, components and ports.
//!
//! Purpose: keep one client's view of participants, positions and room
//! membership consistent with the shared store. Components never talk to a
//! transport directly; they go through the ports in [`ports`].
//!
//! Public surface:
//! - Error / ErrorCode: transport-agnostic failure payload.
//! - Participant, Room, Membership, Ban: data model.
//! - PositionSynchronizer, RoomCoordinator, PresenceTracker, Reconciler:
//!   the core components.
//! - ChatService, SocialService: supplementary services.

pub mod chat;
pub mod error;
pub mod local_state;
pub mod membership;
pub mod participant;
pub mod participant_view;
pub mod ports;
pub mod position;
pub mod position_sync;
pub mod presence;
pub mod reconciliation;
pub mod records;
pub mod room;
pub mod room_directory;
pub mod session;
pub mod social;

pub use self::chat::{ChatChannel, ChatLog, ChatMessage, ChatService, MessageKind};
pub use self::error::{Error, ErrorCode, ErrorValidationError};
pub use self::local_state::LocalState;
pub use self::membership::{DEFAULT_BAN_REASON, RoomCoordinator};
pub use self::participant::{
    Handle, Participant, ParticipantId, ParticipantRow, ParticipantValidationError,
};
pub use self::participant_view::{ParticipantView, ViewChange};
pub use self::position::{DriftVector, Position, PositionOutOfBounds};
pub use self::position_sync::{PositionSynchronizer, SyncOutcome};
pub use self::presence::{PresenceTracker, SignOutContext, SignOutReport, SignOutStep};
pub use self::reconciliation::{Applied, Reconciler};
pub use self::room::{
    Affiliation, Ban, BanId, Membership, Room, RoomDraft, RoomId, RoomName, RoomValidationError,
    Visibility,
};
pub use self::room_directory::{MembershipEcho, RoomDirectory};
pub use self::session::{Session, SessionEvent};
pub use self::social::{Friend, FriendshipGlow, GlowBoard, SocialService};

/// Result alias for domain operations.
pub type DomainResult<T> = Result<T, Error>;
