//! Orchestration layer wiring the domain components to one event loop.
//!
//! A [`StarfieldClient`] owns every component and the client's
//! [`LocalState`]. One task runs [`StarfieldClient::run`], which multiplexes
//! timers, push notifications, background write outcomes, session changes
//! and commands from any number of [`ClientHandle`]s. State is only touched
//! from that task, so no locking is needed. Background work (ticks,
//! refreshes, purges) logs failures at `warn` and carries on; commands log
//! failures at `info` and hand them back to the caller.

mod handle;

use std::sync::Arc;

use mockable::Clock;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub use self::handle::{ClientEvent, ClientHandle, ClientSnapshot, Command, Reply};
use crate::config::ClientSettings;
use crate::domain::ports::{ChangeEvent, IdentityProvider, RemoteStore};
use crate::domain::{
    Affiliation, Applied, Ban, BanId, ChatMessage, ChatService, Error, Friend, LocalState,
    ParticipantId, PositionSynchronizer, PresenceTracker, Reconciler, Room, RoomCoordinator,
    RoomDraft, RoomId, Session, SessionEvent, SignOutContext, SignOutReport, SocialService,
    SyncOutcome,
};

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// Collaborators a client is assembled from.
pub struct ClientParts<S> {
    /// Store acting under the participant's session credential.
    pub store: Arc<S>,
    /// Store acting under the elevated service credential.
    pub service: Arc<S>,
    pub identity: Arc<dyn IdentityProvider>,
    pub clock: Arc<dyn Clock>,
    pub settings: ClientSettings,
}

/// One participant's view of the shared world and the loop that keeps it
/// current.
pub struct StarfieldClient<S> {
    settings: ClientSettings,
    clock: Arc<dyn Clock>,
    identity: Arc<dyn IdentityProvider>,
    sync: PositionSynchronizer<S>,
    coordinator: RoomCoordinator<S>,
    presence: PresenceTracker<S>,
    reconciler: Reconciler<S>,
    chat: ChatService<S>,
    social: SocialService<S>,
    state: LocalState,
    session: Option<Session>,
    pushes: mpsc::UnboundedReceiver<ChangeEvent>,
    outcomes: mpsc::UnboundedReceiver<SyncOutcome>,
    session_changes: broadcast::Receiver<SessionEvent>,
    session_feed_open: bool,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<ClientEvent>,
    room_refresh_due: Option<Instant>,
}

impl<S> StarfieldClient<S>
where
    S: RemoteStore + 'static,
{
    /// Assemble a client and the handle used to drive it.
    pub fn new(parts: ClientParts<S>) -> (Self, ClientHandle) {
        let ClientParts {
            store,
            service,
            identity,
            clock,
            settings,
        } = parts;
        let (push_tx, pushes) = mpsc::unbounded_channel();
        let (outcome_tx, outcomes) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = ClientHandle::new(command_tx, events.clone(), settings.default_room_capacity());

        let client = Self {
            sync: PositionSynchronizer::new(Arc::clone(&store), settings.drift_scale(), outcome_tx),
            coordinator: RoomCoordinator::new(Arc::clone(&store), Arc::clone(&clock)),
            presence: PresenceTracker::new(Arc::clone(&store), service, Arc::clone(&clock)),
            reconciler: Reconciler::new(Arc::clone(&store), push_tx),
            chat: ChatService::new(Arc::clone(&store), Arc::clone(&clock)),
            social: SocialService::new(store),
            state: LocalState::new(settings.message_retention(), settings.friendship_glow()),
            session: None,
            pushes,
            outcomes,
            session_changes: identity.session_changes(),
            session_feed_open: true,
            commands,
            events,
            room_refresh_due: None,
            identity,
            clock,
            settings,
        };
        (client, handle)
    }

    /// Run until every handle is dropped or a shutdown command arrives.
    pub async fn run(mut self) {
        self.adopt_current_session().await;

        let mut tick = time::interval(self.settings.tick_interval());
        let mut refresh = time::interval(self.settings.refresh_interval());
        let mut cleanup = time::interval(self.settings.message_cleanup_interval());
        for timer in [&mut tick, &mut refresh, &mut cleanup] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            let room_refresh_due = self.room_refresh_due;
            tokio::select! {
                _ = tick.tick() => self.on_tick(),
                _ = refresh.tick() => self.on_refresh().await,
                _ = cleanup.tick() => self.on_cleanup().await,
                () = time::sleep_until(room_refresh_due.unwrap_or_else(Instant::now)),
                    if room_refresh_due.is_some() => self.on_room_refresh().await,
                Some(event) = self.pushes.recv() => self.on_push(&event),
                Some(outcome) = self.outcomes.recv() => self.on_outcome(outcome),
                change = self.session_changes.recv(), if self.session_feed_open => {
                    self.on_session_change(change).await;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown();
                        respond(reply, Ok(()));
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.teardown();
                        break;
                    }
                },
            }
        }
        debug!("client loop stopped");
    }

    async fn adopt_current_session(&mut self) {
        match self.identity.current_session().await {
            Ok(Some(session)) => self.sign_in(session).await,
            Ok(None) => {}
            Err(error) => warn!(error = %error, "could not read current session"),
        }
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            debug!("no listeners for client event");
        }
    }

    fn on_tick(&mut self) {
        if self.session.is_none() {
            return;
        }
        let now = self.clock.utc();
        self.state.glows.prune(now);
        self.state.chat.prune(now);
        if let Some(position) = self.sync.tick(&mut self.state.participants) {
            debug!(x = position.x(), y = position.y(), "local participant drifted");
        }
    }

    async fn on_refresh(&mut self) {
        if self.session.is_none() {
            return;
        }
        if let Err(error) = self.refresh_all().await {
            warn!(error = %error, "periodic refresh failed");
        }
    }

    async fn refresh_all(&mut self) -> Result<(), Error> {
        let participants = self.reconciler.refresh_participants(&mut self.state).await?;
        let rooms = self.refresh_rooms().await?;
        debug!(participants, rooms, "full refresh applied");
        Ok(())
    }

    /// Reload the room listing, then rewrite any occupant count that has
    /// drifted from its membership rows.
    async fn refresh_rooms(&mut self) -> Result<usize, Error> {
        let rooms = self.reconciler.refresh_rooms(&mut self.state).await?;
        let corrected = self
            .coordinator
            .reconcile_counts(&mut self.state.rooms)
            .await?;
        if !corrected.is_empty() {
            info!(rooms = corrected.len(), "corrected drifted occupant counts");
        }
        Ok(rooms)
    }

    async fn on_cleanup(&mut self) {
        if self.session.is_none() {
            return;
        }
        if let Err(error) = self.chat.purge_public(self.settings.message_purge_age()).await {
            warn!(error = %error, "public message purge failed");
        }
    }

    async fn on_room_refresh(&mut self) {
        self.room_refresh_due = None;
        if self.session.is_none() || !self.state.rooms.is_stale() {
            return;
        }
        if let Err(error) = self.refresh_rooms().await {
            warn!(error = %error, "room refresh failed");
        }
    }

    fn on_push(&mut self, event: &ChangeEvent) {
        let applied = self.reconciler.apply(event, &mut self.state, self.clock.utc());
        match applied {
            Applied::Kicked(room) => {
                info!(room_id = %room, "removed from room by its owner");
                self.emit(ClientEvent::Kicked(room));
            }
            Applied::Glow(glow) => self.emit(ClientEvent::Glow(glow)),
            Applied::Message(message) => self.emit(ClientEvent::Message(message)),
            _ => {}
        }
        if self.state.rooms.is_stale() && self.room_refresh_due.is_none() {
            self.room_refresh_due = Some(Instant::now() + self.settings.room_refresh_debounce());
        }
    }

    fn on_outcome(&mut self, outcome: SyncOutcome) {
        if self.sync.record_outcome(outcome)
            && let Some(error) = self.sync.last_sync_error()
        {
            self.emit(ClientEvent::SyncFailed(error.clone()));
        }
    }

    async fn on_session_change(&mut self, change: Result<SessionEvent, RecvError>) {
        match change {
            Ok(SessionEvent::SignedIn(session)) => self.sign_in(session).await,
            Ok(SessionEvent::SignedOut) => {
                if self.session.is_some() {
                    info!("session ended by identity provider");
                    self.sign_out().await;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed session changes; resynchronising");
                self.adopt_current_session().await;
            }
            Err(RecvError::Closed) => {
                warn!("identity provider stopped publishing session changes");
                self.session_feed_open = false;
            }
        }
    }

    /// Bring a new session online. Each step that fails is logged and the
    /// remaining steps still run; the periodic refresh repairs the rest.
    async fn sign_in(&mut self, session: Session) {
        if self.session.as_ref() == Some(&session) {
            return;
        }
        if self.session.is_some() {
            self.sign_out().await;
        }
        let me = session.participant_id;
        self.session = Some(session.clone());

        if let Err(error) = self
            .presence
            .mark_online(&session, &self.chat, &mut self.state)
            .await
        {
            warn!(participant = %me, error = %error, "mark online failed");
        }
        if let Err(error) = self
            .sync
            .initialize_position(me, &mut self.state.participants)
            .await
        {
            warn!(participant = %me, error = %error, "position initialisation failed");
        }
        self.sync.begin_session(&session);
        if let Err(error) = self
            .coordinator
            .refresh_affiliation(me, &mut self.state.rooms)
            .await
        {
            warn!(participant = %me, error = %error, "affiliation lookup failed");
        }
        self.reconciler.subscribe_all(me);
        if let Err(error) = self.refresh_all().await {
            warn!(participant = %me, error = %error, "initial refresh failed");
        }
        self.load_history().await;

        info!(participant = %me, handle = %session.handle, "session started");
        self.emit(ClientEvent::SignedIn(session));
    }

    async fn load_history(&mut self) {
        if let Err(error) = self.chat.load_public_history(&mut self.state.chat).await {
            warn!(error = %error, "public history unavailable");
        }
        if let Some(room) = self.state.rooms.affiliation().room() {
            self.load_room_history(room).await;
        }
    }

    async fn load_room_history(&mut self, room: RoomId) {
        if let Err(error) = self.chat.load_room_history(room, &mut self.state.chat).await {
            warn!(room_id = %room, error = %error, "room history unavailable");
        }
    }

    /// Run the sign-out sequence for the active session, if any.
    async fn sign_out(&mut self) -> Option<SignOutReport> {
        let session = self.session.take()?;
        self.sync.end_session();
        self.room_refresh_due = None;
        let report = self
            .presence
            .sign_out(SignOutContext {
                session: &session,
                coordinator: &self.coordinator,
                chat: &self.chat,
                reconciler: &mut self.reconciler,
                identity: self.identity.as_ref(),
                state: &mut self.state,
            })
            .await;
        info!(
            participant = %session.participant_id,
            clean = report.is_clean(),
            "session ended"
        );
        self.emit(ClientEvent::SignedOut(report.clone()));
        Some(report)
    }

    fn teardown(&mut self) {
        self.sync.end_session();
        if let Err(error) = self.reconciler.release_all() {
            warn!(error = %error, "subscription release failed during teardown");
        }
    }

    fn current_session(&self) -> Result<Session, Error> {
        self.session
            .clone()
            .ok_or_else(|| Error::unauthorized("sign in first"))
    }

    fn me(&self) -> Result<ParticipantId, Error> {
        self.current_session().map(|session| session.participant_id)
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::CreateRoom { draft, reply } => {
                let result = self.create_room(draft).await;
                respond(reply, surface("create_room", result));
            }
            Command::JoinRoom { room, reply } => {
                let result = self.join_room(room).await;
                respond(reply, surface("join_room", result));
            }
            Command::LeaveRoom { reply } => {
                let result = self.leave_room().await;
                respond(reply, surface("leave_room", result));
            }
            Command::Kick { target, reply } => {
                let result = self.kick(target).await;
                respond(reply, surface("kick", result));
            }
            Command::Ban {
                target,
                reason,
                reply,
            } => {
                let result = self.ban(target, reason).await;
                respond(reply, surface("ban", result));
            }
            Command::Unban { ban, reply } => {
                let result = self.unban(ban).await;
                respond(reply, surface("unban", result));
            }
            Command::TransferOwnership { new_owner, reply } => {
                let result = self.transfer_ownership(new_owner).await;
                respond(reply, surface("transfer_ownership", result));
            }
            Command::PublicRooms { reply } => {
                let result = self.coordinator.list_public_rooms().await;
                respond(reply, surface("public_rooms", result));
            }
            Command::Members { room, reply } => {
                let result = self.coordinator.members(room).await;
                respond(reply, surface("members", result));
            }
            Command::Bans { room, reply } => {
                let result = self.coordinator.bans(room).await;
                respond(reply, surface("bans", result));
            }
            Command::SendPublic { content, reply } => {
                let result = self.send_public(&content).await;
                let result = self.keep_sent(result);
                respond(reply, surface("send_public", result));
            }
            Command::SendRoom { content, reply } => {
                let result = self.send_room(&content).await;
                let result = self.keep_sent(result);
                respond(reply, surface("send_room", result));
            }
            Command::SendPrivate { to, content, reply } => {
                let result = self.send_private(to, &content).await;
                let result = self.keep_sent(result);
                respond(reply, surface("send_private", result));
            }
            Command::Follow { target, reply } => {
                let result = self.follow(target).await;
                respond(reply, surface("follow", result));
            }
            Command::MutualFriends { reply } => {
                let result = self.mutual_friends().await;
                respond(reply, surface("mutual_friends", result));
            }
            Command::ResetPositions { reply } => {
                let result = self.sync.reset_positions(&mut self.state.participants).await;
                respond(reply, surface("reset_positions", result));
            }
            Command::Refresh { reply } => {
                let result = self.refresh().await;
                respond(reply, surface("refresh", result));
            }
            Command::Tick { reply } => {
                self.on_tick();
                respond(reply, Ok(self.state.participants.local().map(|p| p.position)));
            }
            Command::Snapshot { reply } => {
                let snapshot = ClientSnapshot {
                    session: self.session.clone(),
                    state: self.state.clone(),
                    last_sync_error: self.sync.last_sync_error().cloned(),
                };
                respond(reply, Ok(snapshot));
            }
            Command::SignOut { reply } => {
                let result = self
                    .sign_out()
                    .await
                    .ok_or_else(|| Error::unauthorized("no active session"));
                respond(reply, surface("sign_out", result));
            }
            Command::Shutdown { reply } => {
                // Handled by the loop before dispatch.
                respond(reply, Ok(()));
            }
        }
    }

    async fn kick(&mut self, target: ParticipantId) -> Result<RoomId, Error> {
        let me = self.me()?;
        self.coordinator.kick(me, target, &mut self.state.rooms).await
    }

    async fn ban(&mut self, target: ParticipantId, reason: Option<String>) -> Result<Ban, Error> {
        let me = self.me()?;
        self.coordinator
            .ban(me, target, reason, &mut self.state.rooms)
            .await
    }

    async fn unban(&self, ban: BanId) -> Result<(), Error> {
        let me = self.me()?;
        self.coordinator.unban(me, ban).await
    }

    async fn transfer_ownership(&mut self, new_owner: ParticipantId) -> Result<(), Error> {
        let me = self.me()?;
        self.coordinator
            .transfer_ownership(me, new_owner, &mut self.state.rooms)
            .await
    }

    async fn send_public(&self, content: &str) -> Result<ChatMessage, Error> {
        let session = self.current_session()?;
        self.chat.send_public(&session, content).await
    }

    async fn send_private(&self, to: ParticipantId, content: &str) -> Result<ChatMessage, Error> {
        let session = self.current_session()?;
        self.chat.send_private(&session, to, content).await
    }

    async fn follow(&self, target: ParticipantId) -> Result<bool, Error> {
        let me = self.me()?;
        self.social.follow(me, target).await
    }

    async fn mutual_friends(&self) -> Result<Vec<Friend>, Error> {
        let me = self.me()?;
        self.social.mutual_friends(me).await
    }

    async fn refresh(&mut self) -> Result<(), Error> {
        self.current_session()?;
        self.refresh_all().await
    }

    async fn create_room(&mut self, draft: RoomDraft) -> Result<Room, Error> {
        let session = self.current_session()?;
        let previous = self.state.rooms.affiliation();
        let result = self
            .coordinator
            .create(session.participant_id, draft, &mut self.state.rooms)
            .await;
        self.after_move(previous);
        result
    }

    async fn join_room(&mut self, room: RoomId) -> Result<(), Error> {
        let session = self.current_session()?;
        let previous = self.state.rooms.affiliation();
        let result = self
            .coordinator
            .join(session.participant_id, room, &mut self.state.rooms)
            .await;
        self.after_move(previous);
        if result.is_ok() && previous != Affiliation::Member(room) {
            self.load_room_history(room).await;
        }
        result
    }

    async fn leave_room(&mut self) -> Result<Option<RoomId>, Error> {
        let session = self.current_session()?;
        let previous = self.state.rooms.affiliation();
        let result = self
            .coordinator
            .leave(session.participant_id, &mut self.state.rooms)
            .await;
        self.after_move(previous);
        result
    }

    /// Drop the log of a room the participant is no longer in.
    fn after_move(&mut self, previous: Affiliation) {
        if let Some(old) = previous.room()
            && self.state.rooms.affiliation() != previous
        {
            self.state.chat.clear_room(old);
        }
    }

    async fn send_room(&self, content: &str) -> Result<ChatMessage, Error> {
        let session = self.current_session()?;
        let affiliation = self.state.rooms.affiliation();
        let Some(room) = affiliation.room() else {
            return Err(Error::permission_denied("join a room before posting to it"));
        };
        self.chat.send_room(&session, affiliation, room, content).await
    }

    /// Show a sent message before its echo arrives; the echo is deduplicated.
    fn keep_sent(&mut self, result: Result<ChatMessage, Error>) -> Result<ChatMessage, Error> {
        if let Ok(message) = &result {
            self.state.chat.ingest(message.clone(), self.clock.utc());
        }
        result
    }
}

fn surface<T>(operation: &'static str, result: Result<T, Error>) -> Result<T, Error> {
    if let Err(error) = &result {
        info!(operation, code = ?error.code(), error = %error, "command failed");
    }
    result
}

fn respond<T>(reply: oneshot::Sender<Result<T, Error>>, result: Result<T, Error>) {
    if reply.send(result).is_err() {
        debug!("command caller went away before the reply");
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
