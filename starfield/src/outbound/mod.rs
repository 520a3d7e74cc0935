//! Outbound adapters implementing the domain ports.
//!
//! - memory: shared in-process backend, store clients and identity provider.

pub mod memory;
