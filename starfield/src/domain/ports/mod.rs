//! Domain ports and supporting types for the hexagonal boundary.

mod macros;
pub(crate) use macros::define_port_error;

mod identity_provider;
mod remote_store;

#[cfg(test)]
pub use identity_provider::MockIdentityProvider;
pub use identity_provider::{IdentityProvider, IdentityProviderError};
#[cfg(test)]
pub use remote_store::MockRemoteStore;
pub use remote_store::{
    ChangeEvent, ChangeKind, Comparison, Condition, EventFilter, Filter, OrderBy, Procedure,
    Record, RemoteStore, RemoteStoreError, SubscriptionHandle, Table,
};
pub(crate) use remote_store::compare_values;
