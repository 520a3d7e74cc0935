//! Cloneable front door to a running [`StarfieldClient`](super::StarfieldClient).
//!
//! Each call sends one [`Command`] into the event loop and awaits its reply.
//! Commands run one at a time, so a slow remote call delays the next
//! command but never interleaves with another mutation of local state.

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::domain::{
    Ban, BanId, ChatMessage, Error, Friend, FriendshipGlow, LocalState, Membership,
    ParticipantId, Position, Room, RoomDraft, RoomId, Session, SignOutReport,
};

/// Reply channel carried by every command.
pub type Reply<T> = oneshot::Sender<Result<T, Error>>;

/// Requests handled by the event loop.
#[derive(Debug)]
pub enum Command {
    CreateRoom { draft: RoomDraft, reply: Reply<Room> },
    JoinRoom { room: RoomId, reply: Reply<()> },
    LeaveRoom { reply: Reply<Option<RoomId>> },
    Kick { target: ParticipantId, reply: Reply<RoomId> },
    Ban {
        target: ParticipantId,
        reason: Option<String>,
        reply: Reply<Ban>,
    },
    Unban { ban: BanId, reply: Reply<()> },
    TransferOwnership {
        new_owner: ParticipantId,
        reply: Reply<()>,
    },
    PublicRooms { reply: Reply<Vec<Room>> },
    Members { room: RoomId, reply: Reply<Vec<Membership>> },
    Bans { room: RoomId, reply: Reply<Vec<Ban>> },
    SendPublic { content: String, reply: Reply<ChatMessage> },
    SendRoom { content: String, reply: Reply<ChatMessage> },
    SendPrivate {
        to: ParticipantId,
        content: String,
        reply: Reply<ChatMessage>,
    },
    Follow { target: ParticipantId, reply: Reply<bool> },
    MutualFriends { reply: Reply<Vec<Friend>> },
    ResetPositions { reply: Reply<()> },
    /// Run the periodic refresh now.
    Refresh { reply: Reply<()> },
    /// Run one drift tick now.
    Tick { reply: Reply<Option<Position>> },
    Snapshot { reply: Reply<ClientSnapshot> },
    SignOut { reply: Reply<SignOutReport> },
    Shutdown { reply: Reply<()> },
}

/// Notable things the loop observed, for whoever renders them.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    SignedIn(Session),
    SignedOut(SignOutReport),
    /// Someone else removed the local participant from this room.
    Kicked(RoomId),
    Glow(FriendshipGlow),
    Message(ChatMessage),
    /// A background position write failed.
    SyncFailed(Error),
}

/// Copy of the loop's state at one instant.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub session: Option<Session>,
    pub state: LocalState,
    pub last_sync_error: Option<Error>,
}

/// Sends commands to the event loop. Dropping every handle stops the loop.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
    default_capacity: u32,
}

fn loop_stopped() -> Error {
    Error::internal("client event loop has stopped")
}

impl ClientHandle {
    pub(super) fn new(
        commands: mpsc::Sender<Command>,
        events: broadcast::Sender<ClientEvent>,
        default_capacity: u32,
    ) -> Self {
        Self {
            commands,
            events,
            default_capacity,
        }
    }

    /// Subscribe to client events from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, Error> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| loop_stopped())?;
        response.await.map_err(|_| loop_stopped())?
    }

    /// Create a public room, using the configured capacity when none is
    /// given.
    pub async fn create_room(&self, name: &str, capacity: Option<u32>) -> Result<Room, Error> {
        let draft = RoomDraft::new(name, capacity.unwrap_or(self.default_capacity))
            .map_err(|err| Error::invalid_request(err.to_string()))?;
        self.create_room_from(draft).await
    }

    pub async fn create_room_from(&self, draft: RoomDraft) -> Result<Room, Error> {
        self.request(|reply| Command::CreateRoom { draft, reply })
            .await
    }

    pub async fn join_room(&self, room: RoomId) -> Result<(), Error> {
        self.request(|reply| Command::JoinRoom { room, reply }).await
    }

    pub async fn leave_room(&self) -> Result<Option<RoomId>, Error> {
        self.request(|reply| Command::LeaveRoom { reply }).await
    }

    pub async fn kick(&self, target: ParticipantId) -> Result<RoomId, Error> {
        self.request(|reply| Command::Kick { target, reply }).await
    }

    pub async fn ban(&self, target: ParticipantId, reason: Option<String>) -> Result<Ban, Error> {
        self.request(|reply| Command::Ban {
            target,
            reason,
            reply,
        })
        .await
    }

    pub async fn unban(&self, ban: BanId) -> Result<(), Error> {
        self.request(|reply| Command::Unban { ban, reply }).await
    }

    pub async fn transfer_ownership(&self, new_owner: ParticipantId) -> Result<(), Error> {
        self.request(|reply| Command::TransferOwnership { new_owner, reply })
            .await
    }

    pub async fn public_rooms(&self) -> Result<Vec<Room>, Error> {
        self.request(|reply| Command::PublicRooms { reply }).await
    }

    pub async fn members(&self, room: RoomId) -> Result<Vec<Membership>, Error> {
        self.request(|reply| Command::Members { room, reply }).await
    }

    pub async fn bans(&self, room: RoomId) -> Result<Vec<Ban>, Error> {
        self.request(|reply| Command::Bans { room, reply }).await
    }

    pub async fn send_public(&self, content: impl Into<String>) -> Result<ChatMessage, Error> {
        let content = content.into();
        self.request(|reply| Command::SendPublic { content, reply })
            .await
    }

    /// Post to the current room.
    pub async fn send_room(&self, content: impl Into<String>) -> Result<ChatMessage, Error> {
        let content = content.into();
        self.request(|reply| Command::SendRoom { content, reply })
            .await
    }

    pub async fn send_private(
        &self,
        to: ParticipantId,
        content: impl Into<String>,
    ) -> Result<ChatMessage, Error> {
        let content = content.into();
        self.request(|reply| Command::SendPrivate { to, content, reply })
            .await
    }

    /// Follow `target`; `true` when the follow made the pair mutual.
    pub async fn follow(&self, target: ParticipantId) -> Result<bool, Error> {
        self.request(|reply| Command::Follow { target, reply }).await
    }

    pub async fn mutual_friends(&self) -> Result<Vec<Friend>, Error> {
        self.request(|reply| Command::MutualFriends { reply }).await
    }

    pub async fn reset_positions(&self) -> Result<(), Error> {
        self.request(|reply| Command::ResetPositions { reply }).await
    }

    pub async fn refresh(&self) -> Result<(), Error> {
        self.request(|reply| Command::Refresh { reply }).await
    }

    pub async fn tick(&self) -> Result<Option<Position>, Error> {
        self.request(|reply| Command::Tick { reply }).await
    }

    pub async fn snapshot(&self) -> Result<ClientSnapshot, Error> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Run the sign-out sequence. Step failures are in the report.
    pub async fn sign_out(&self) -> Result<SignOutReport, Error> {
        self.request(|reply| Command::SignOut { reply }).await
    }

    /// Release subscriptions and stop the loop without signing out.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
