//! Port for the external identity provider.
//!
//! The provider owns the session lifecycle. The client only needs the current
//! session, a stream of sign-in/sign-out transitions, and a way to end the
//! session.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::{Session, SessionEvent};

use super::define_port_error;

define_port_error! {
    /// Errors raised by identity provider adapters.
    pub enum IdentityProviderError {
        /// The provider could not be reached.
        Unavailable { message: String } => "identity provider unavailable: {message}",
        /// The operation needs a session and none is active.
        NoSession => "no active session",
    }
}

/// Session lifecycle port.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The active session, if any.
    async fn current_session(&self) -> Result<Option<Session>, IdentityProviderError>;

    /// Subscribe to session transitions.
    fn session_changes(&self) -> broadcast::Receiver<SessionEvent>;

    /// End the active session and invalidate its credential.
    async fn sign_out(&self) -> Result<(), IdentityProviderError>;
}
