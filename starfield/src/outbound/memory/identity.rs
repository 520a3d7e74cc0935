//! `IdentityProvider` adapter issuing sessions against [`InMemoryBackend`].

use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use mockable::Clock;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::backend::InMemoryBackend;
use super::store_client::{MemoryStoreClient, SessionSlot};
use crate::domain::ports::{IdentityProvider, IdentityProviderError};
use crate::domain::{Handle, Session, SessionEvent};

const SESSION_EVENT_CAPACITY: usize = 16;

/// Identity provider for one client. Sessions it issues are written into a
/// slot shared with the store clients it hands out.
pub struct MemoryIdentityProvider {
    backend: InMemoryBackend,
    clock: Arc<dyn Clock>,
    slot: SessionSlot,
    current: Mutex<Option<Session>>,
    events: broadcast::Sender<SessionEvent>,
}

impl MemoryIdentityProvider {
    pub fn new(backend: InMemoryBackend, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            backend,
            clock,
            slot: Arc::new(RwLock::new(None)),
            current: Mutex::new(None),
            events,
        }
    }

    /// Store client bound to this provider's session credential.
    pub fn session_store(&self) -> MemoryStoreClient {
        MemoryStoreClient::for_session(self.backend.clone(), Arc::clone(&self.slot))
    }

    /// Authenticate as `handle`, reusing the account id on later sign-ins.
    pub fn sign_in(&self, handle: &str) -> Result<Session, IdentityProviderError> {
        let handle = Handle::new(handle)
            .map_err(|err| IdentityProviderError::unavailable(err.to_string()))?;
        let (participant_id, token) = self
            .backend
            .open_session(handle.as_ref())
            .map_err(|err| IdentityProviderError::unavailable(err.to_string()))?;
        let session = Session {
            participant_id,
            handle,
            started_at: self.clock.utc(),
        };
        *self.slot.write().map_err(|_| poisoned())? = Some(token);
        *self.current.lock().map_err(|_| poisoned())? = Some(session.clone());
        info!(participant = %session.participant_id, handle = %session.handle, "signed in");
        self.broadcast(SessionEvent::SignedIn(session.clone()));
        Ok(session)
    }

    fn broadcast(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("no listeners for session change");
        }
    }

    /// Drop the credential server-side without telling the client, the way
    /// an expired token behaves.
    pub fn expire_session(&self) -> Result<(), IdentityProviderError> {
        let token = self.slot.read().map_err(|_| poisoned())?.clone();
        if let Some(token) = token {
            self.backend
                .revoke_session(&token)
                .map_err(|err| IdentityProviderError::unavailable(err.to_string()))?;
        }
        Ok(())
    }
}

fn poisoned() -> IdentityProviderError {
    IdentityProviderError::unavailable("session state lock poisoned")
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn current_session(&self) -> Result<Option<Session>, IdentityProviderError> {
        Ok(self.current.lock().map_err(|_| poisoned())?.clone())
    }

    fn session_changes(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn sign_out(&self) -> Result<(), IdentityProviderError> {
        let session = self.current.lock().map_err(|_| poisoned())?.take();
        if session.is_none() {
            return Err(IdentityProviderError::no_session());
        }
        let token = self.slot.write().map_err(|_| poisoned())?.take();
        if let Some(token) = token {
            self.backend
                .revoke_session(&token)
                .map_err(|err| IdentityProviderError::unavailable(err.to_string()))?;
        }
        self.broadcast(SessionEvent::SignedOut);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    //! Regression coverage for this module.

    use chrono::{TimeZone, Utc};
    use rstest::{fixture, rstest};

    use super::*;
    use crate::test_support::MutableClock;

    #[fixture]
    fn provider() -> MemoryIdentityProvider {
        let clock: Arc<dyn Clock> = Arc::new(MutableClock::new(
            Utc.with_ymd_and_hms(2026, 6, 6, 6, 0, 0)
                .single()
                .expect("valid instant"),
        ));
        MemoryIdentityProvider::new(InMemoryBackend::new(Arc::clone(&clock)), clock)
    }

    #[rstest]
    #[tokio::test]
    async fn sign_in_broadcasts_and_reuses_account(provider: MemoryIdentityProvider) {
        let mut changes = provider.session_changes();
        let first = provider.sign_in("Rigel").expect("sign in");
        assert!(matches!(
            changes.recv().await.expect("event"),
            SessionEvent::SignedIn(ref s) if s == &first
        ));
        provider.sign_out().await.expect("sign out");
        assert_eq!(changes.recv().await.expect("event"), SessionEvent::SignedOut);

        let second = provider.sign_in("rigel").expect("sign in again");
        assert_eq!(first.participant_id, second.participant_id);
    }

    #[rstest]
    #[tokio::test]
    async fn sign_out_without_session_fails(provider: MemoryIdentityProvider) {
        let err = provider.sign_out().await.expect_err("no session");
        assert_eq!(err, IdentityProviderError::no_session());
    }
}
