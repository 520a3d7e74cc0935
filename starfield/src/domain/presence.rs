//! Online/offline lifecycle and sign-in/sign-out sequencing.
//!
//! Ordinary writes use the participant's own session credential. Offline
//! marking goes through a separate service credential so it still succeeds
//! after the session has been invalidated.

use std::fmt;
use std::sync::Arc;

use mockable::Clock;
use serde_json::json;
use tracing::{debug, warn};

use crate::domain::ports::{IdentityProvider, Procedure, RemoteStore, Table};
use crate::domain::records::{columns, decode, record};
use crate::domain::{
    ChatService, Error, Handle, LocalState, MessageKind, ParticipantRow, Reconciler,
    RoomCoordinator, Session,
};

/// Steps of the sign-out sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutStep {
    LeaveRoom,
    AnnounceDeparture,
    MarkLocalOffline,
    MarkOffline,
    ReleaseSubscriptions,
    EndSession,
}

impl fmt::Display for SignOutStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LeaveRoom => "leave_room",
            Self::AnnounceDeparture => "announce_departure",
            Self::MarkLocalOffline => "mark_local_offline",
            Self::MarkOffline => "mark_offline",
            Self::ReleaseSubscriptions => "release_subscriptions",
            Self::EndSession => "end_session",
        };
        f.write_str(name)
    }
}

/// Per-step failures of a completed sign-out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignOutReport {
    pub completed: Vec<SignOutStep>,
    pub failures: Vec<(SignOutStep, Error)>,
}

impl SignOutReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, step: SignOutStep, result: Result<(), Error>) {
        match result {
            Ok(()) => self.completed.push(step),
            Err(error) => {
                warn!(%step, error = %error, "sign-out step failed");
                self.failures.push((step, error));
            }
        }
    }
}

/// Collaborators the sign-out sequence drives.
pub struct SignOutContext<'a, S, I: ?Sized> {
    pub session: &'a Session,
    pub coordinator: &'a RoomCoordinator<S>,
    pub chat: &'a ChatService<S>,
    pub reconciler: &'a mut Reconciler<S>,
    pub identity: &'a I,
    pub state: &'a mut LocalState,
}

/// Tracks whether the local participant is online.
pub struct PresenceTracker<S> {
    store: Arc<S>,
    service: Arc<S>,
    clock: Arc<dyn Clock>,
    announced: bool,
}

impl<S> PresenceTracker<S> {
    /// `store` carries the session credential, `service` the elevated one.
    pub fn new(store: Arc<S>, service: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            service,
            clock,
            announced: false,
        }
    }

    /// Whether the join announcement went out this session.
    #[must_use]
    pub fn has_announced(&self) -> bool {
        self.announced
    }
}

impl<S> PresenceTracker<S>
where
    S: RemoteStore,
{
    /// Upsert the participant as online and announce the first arrival of
    /// this session. Repeated calls only refresh `last_seen`.
    pub async fn mark_online(
        &mut self,
        session: &Session,
        chat: &ChatService<S>,
        state: &mut LocalState,
    ) -> Result<(), Error> {
        let values = record(json!({
            "id": session.participant_id,
            "handle": session.handle,
            "online": true,
            "last_seen": self.clock.utc(),
        }));
        let stored = self
            .store
            .upsert_row(Table::Participants, &[columns::ID], values)
            .await?;
        let row: ParticipantRow = decode(Table::Participants, &stored)?;
        state.participants.set_local(Some(session.participant_id));
        state
            .participants
            .upsert_row(&row)
            .map_err(|err| Error::internal(format!("stored participant is invalid: {err}")))?;
        state.participants.set_online(session.participant_id, true);

        if !self.announced {
            match chat.announce(MessageKind::Join, &session.handle).await {
                Ok(message) => {
                    state.chat.ingest(message, self.clock.utc());
                    self.announced = true;
                }
                Err(error) => warn!(handle = %session.handle, error = %error, "join announcement failed"),
            }
        }
        debug!(participant = %session.participant_id, "marked online");
        Ok(())
    }

    /// Flag a participant offline through the service credential.
    pub async fn mark_offline(&self, handle: &Handle) -> Result<(), Error> {
        self.service
            .call_procedure(
                Procedure::MarkOffline,
                json!({ "handle": handle, "last_seen": self.clock.utc() }),
            )
            .await?;
        debug!(%handle, "marked offline");
        Ok(())
    }

    /// Run the full sign-out sequence. Every step runs even when earlier
    /// ones fail; failures are collected in the report.
    pub async fn sign_out<I>(&mut self, ctx: SignOutContext<'_, S, I>) -> SignOutReport
    where
        I: IdentityProvider + ?Sized,
    {
        let SignOutContext {
            session,
            coordinator,
            chat,
            reconciler,
            identity,
            state,
        } = ctx;
        let mut report = SignOutReport::default();

        let left = coordinator
            .leave(session.participant_id, &mut state.rooms)
            .await
            .map(|_| ());
        report.record(SignOutStep::LeaveRoom, left);

        let announced = chat
            .announce(MessageKind::Leave, &session.handle)
            .await
            .map(|_| ());
        report.record(SignOutStep::AnnounceDeparture, announced);

        let local = if state.participants.set_online(session.participant_id, false) {
            Ok(())
        } else {
            Err(Error::not_found("local participant missing from view"))
        };
        report.record(SignOutStep::MarkLocalOffline, local);

        report.record(SignOutStep::MarkOffline, self.mark_offline(&session.handle).await);

        report.record(SignOutStep::ReleaseSubscriptions, reconciler.release_all());

        let ended = identity.sign_out().await.map_err(Error::from);
        report.record(SignOutStep::EndSession, ended);

        self.announced = false;
        state.reset_session();
        debug!(
            participant = %session.participant_id,
            failures = report.failures.len(),
            "sign-out sequence finished"
        );
        report
    }
}

#[cfg(test)]
#[path = "presence_tests.rs"]
mod tests;
