//! In-process adapters backing every port with shared memory.
//!
//! Several clients in one process share an [`InMemoryBackend`]; each gets
//! its own [`MemoryIdentityProvider`] and a session-bound
//! [`MemoryStoreClient`], plus a service-credential client for offline
//! marking.

mod backend;
mod identity;
mod store_client;

pub use backend::{Credential, InMemoryBackend};
pub use identity::MemoryIdentityProvider;
pub use store_client::{MemoryStoreClient, SessionSlot};
