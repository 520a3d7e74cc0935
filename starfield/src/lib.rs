//! Starfield client library.
//!
//! Keeps one participant's view of who is online, where they are and which
//! room they occupy consistent with a shared backend of record.

pub mod client;
pub mod config;
pub mod domain;
pub mod outbound;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use client::{ClientEvent, ClientHandle, ClientParts, StarfieldClient};
pub use config::ClientSettings;
