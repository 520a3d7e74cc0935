//! `RemoteStore` adapter over [`InMemoryBackend`].

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::backend::{Credential, InMemoryBackend};
use crate::domain::ports::{
    ChangeEvent, EventFilter, Filter, OrderBy, Procedure, Record, RemoteStore, RemoteStoreError,
    SubscriptionHandle, Table,
};

/// Session token slot shared with the identity adapter that fills it.
pub type SessionSlot = Arc<RwLock<Option<String>>>;

#[derive(Clone)]
enum Binding {
    Session(SessionSlot),
    Service,
}

/// Store client acting under one credential.
#[derive(Clone)]
pub struct MemoryStoreClient {
    backend: InMemoryBackend,
    binding: Binding,
}

impl MemoryStoreClient {
    /// Client using whatever session token `slot` currently holds.
    pub fn for_session(backend: InMemoryBackend, slot: SessionSlot) -> Self {
        Self {
            backend,
            binding: Binding::Session(slot),
        }
    }

    /// Client holding the elevated service credential.
    pub fn service(backend: InMemoryBackend) -> Self {
        Self {
            backend,
            binding: Binding::Service,
        }
    }

    fn credential(&self) -> Result<Credential, RemoteStoreError> {
        let credential = match &self.binding {
            Binding::Service => Credential::Service,
            Binding::Session(slot) => {
                let token = slot
                    .read()
                    .map_err(|_| RemoteStoreError::connection("session slot lock poisoned"))?
                    .clone()
                    .ok_or_else(|| RemoteStoreError::unauthorized("no session"))?;
                Credential::Session(token)
            }
        };
        self.backend.authorize(&credential)?;
        Ok(credential)
    }
}

#[async_trait]
impl RemoteStore for MemoryStoreClient {
    async fn upsert_row(
        &self,
        table: Table,
        key_columns: &[&'static str],
        values: Record,
    ) -> Result<Record, RemoteStoreError> {
        self.credential()?;
        self.backend.upsert(table, key_columns, values)
    }

    async fn insert_row(&self, table: Table, values: Record) -> Result<Record, RemoteStoreError> {
        self.credential()?;
        self.backend.insert(table, values)
    }

    async fn update_where(
        &self,
        table: Table,
        filter: &Filter,
        values: Record,
    ) -> Result<u64, RemoteStoreError> {
        self.credential()?;
        self.backend.update(table, filter, &values)
    }

    async fn delete_where(&self, table: Table, filter: &Filter) -> Result<u64, RemoteStoreError> {
        self.credential()?;
        self.backend.delete(table, filter)
    }

    async fn select_where(
        &self,
        table: Table,
        filter: &Filter,
        order: Option<OrderBy>,
    ) -> Result<Vec<Record>, RemoteStoreError> {
        self.credential()?;
        self.backend.select(table, filter, order.as_ref())
    }

    async fn call_procedure(
        &self,
        procedure: Procedure,
        args: Value,
    ) -> Result<Value, RemoteStoreError> {
        let credential = self.credential()?;
        debug!(%procedure, "calling procedure");
        self.backend.call(&credential, procedure, &args)
    }

    fn subscribe(
        &self,
        table: Table,
        filter: EventFilter,
        sink: mpsc::UnboundedSender<ChangeEvent>,
    ) -> Result<SubscriptionHandle, RemoteStoreError> {
        self.credential()?;
        self.backend.subscribe(table, filter, sink)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), RemoteStoreError> {
        self.backend.unsubscribe(handle)
    }
}
