//! Several clients sharing one in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use mockable::Clock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::MutableClock;
use crate::client::{ClientEvent, ClientHandle, ClientParts, ClientSnapshot, StarfieldClient};
use crate::config::ClientSettings;
use crate::domain::Session;
use crate::outbound::memory::{InMemoryBackend, MemoryIdentityProvider, MemoryStoreClient};

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(10);

/// Settings whose timers stay out of the way: ticks, refreshes and purges
/// effectively never fire, while room refreshes are debounced briefly.
#[must_use]
pub fn quiet_settings() -> ClientSettings {
    ClientSettings {
        tick_interval_ms: Some(3_600_000),
        refresh_interval_ms: Some(3_600_000),
        room_refresh_debounce_ms: Some(20),
        message_cleanup_interval_secs: Some(3_600),
        ..ClientSettings::default()
    }
}

/// Shared backend plus a controllable clock.
pub struct TestWorld {
    pub backend: InMemoryBackend,
    pub clock: Arc<MutableClock>,
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl TestWorld {
    /// # Panics
    /// Never in practice; the start instant is a valid literal.
    #[must_use]
    pub fn new() -> Self {
        let Some(start) = Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).single() else {
            panic!("start instant");
        };
        let clock = Arc::new(MutableClock::new(start));
        let shared: Arc<dyn Clock> = clock.clone();
        Self {
            backend: InMemoryBackend::new(shared),
            clock,
        }
    }

    /// Spawn a client with its own identity provider.
    #[must_use]
    pub fn client(&self, settings: ClientSettings) -> TestClient {
        let clock: Arc<dyn Clock> = self.clock.clone();
        let identity = Arc::new(MemoryIdentityProvider::new(
            self.backend.clone(),
            Arc::clone(&clock),
        ));
        let (client, handle) = StarfieldClient::new(ClientParts {
            store: Arc::new(identity.session_store()),
            service: Arc::new(MemoryStoreClient::service(self.backend.clone())),
            identity: identity.clone(),
            clock,
            settings,
        });
        let events = handle.events();
        let task = tokio::spawn(client.run());
        TestClient {
            handle,
            identity,
            events,
            task,
        }
    }
}

/// A running client and the knobs tests need around it.
pub struct TestClient {
    pub handle: ClientHandle,
    pub identity: Arc<MemoryIdentityProvider>,
    events: broadcast::Receiver<ClientEvent>,
    task: JoinHandle<()>,
}

impl TestClient {
    /// Sign in as `handle` and wait until the loop has brought the session
    /// online.
    ///
    /// # Panics
    /// Panics when sign-in fails or the loop never reports it.
    pub async fn sign_in(&mut self, handle: &str) -> Session {
        let session = match self.identity.sign_in(handle) {
            Ok(session) => session,
            Err(error) => panic!("sign in as {handle}: {error}"),
        };
        let expected = session.clone();
        self.wait_for(move |event| matches!(event, ClientEvent::SignedIn(s) if *s == expected))
            .await;
        session
    }

    /// Wait for the first event matching `predicate`.
    ///
    /// # Panics
    /// Panics when no such event arrives in time.
    pub async fn wait_for(&mut self, predicate: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
        let found = tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if predicate(&event) => return Some(event),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await;
        match found {
            Ok(Some(event)) => event,
            Ok(None) => panic!("client event stream closed"),
            Err(_) => panic!("timed out waiting for client event"),
        }
    }

    /// # Panics
    /// Panics when the loop has stopped.
    pub async fn snapshot(&self) -> ClientSnapshot {
        match self.handle.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(error) => panic!("snapshot: {error}"),
        }
    }

    /// Poll snapshots until `condition` holds.
    ///
    /// # Panics
    /// Panics when the condition does not hold in time.
    pub async fn eventually(&self, condition: impl Fn(&ClientSnapshot) -> bool) -> ClientSnapshot {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let snapshot = self.snapshot().await;
            if condition(&snapshot) {
                return snapshot;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(POLL).await;
        }
    }

    /// Stop the loop and wait for it to finish.
    ///
    /// # Panics
    /// Panics when the loop task panicked.
    pub async fn stop(self) {
        if let Err(error) = self.handle.shutdown().await {
            tracing::debug!(error = %error, "client loop already stopped");
        }
        if let Err(error) = self.task.await {
            panic!("client task failed: {error}");
        }
    }
}
