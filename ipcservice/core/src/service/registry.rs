//! Client Registry
//!
//! Thread-safe map from [`ClientId`] to the service's baseline [`Client`]
//! reference. Each client keeps a weak pointer to it so that
//! [`Client::close`] can remove itself from any thread.
//!
//! # Thread Safety
//!
//! The registry uses `Arc<RwLock<>>`: lookups take the read lock, accepts and
//! disconnects take the write lock. Handles removed from the map are always
//! dropped after the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::client::{Client, ClientId};
use crate::error::{IpcError, IpcResult};

/// Registry contents
#[derive(Default)]
pub(crate) struct RegistryState {
    pub(crate) clients: HashMap<ClientId, Client>,
    closed: bool,
}

/// Remove a client from the registry state, returning the baseline reference
pub(crate) fn detach(state: &RwLock<RegistryState>, id: &ClientId) -> Option<Client> {
    state.write().clients.remove(id)
}

/// Registry of clients connected to one service
#[derive(Clone, Default)]
pub(crate) struct ClientRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl ClientRegistry {
    /// Create a new empty registry
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Weak pointer stored in each client for self-removal on close
    pub(crate) fn downgrade(&self) -> Weak<RwLock<RegistryState>> {
        Arc::downgrade(&self.inner)
    }

    /// Register a newly accepted client
    pub(crate) fn register(&self, client: Client) -> IpcResult<()> {
        let mut state = self.inner.write();
        if state.closed {
            return Err(IpcError::ServiceClosed);
        }
        let id = client.id();
        state.clients.insert(id, client);
        drop(state);

        tracing::debug!(client_id = %id, "Client registered");
        Ok(())
    }

    /// Remove a client, handing its baseline reference to the caller
    pub(crate) fn unregister(&self, id: &ClientId) -> Option<Client> {
        let removed = detach(&self.inner, id);
        if removed.is_some() {
            tracing::debug!(client_id = %id, "Client unregistered");
        }
        removed
    }

    /// Mark closed and drain every remaining client
    pub(crate) fn close(&self) -> Vec<Client> {
        let mut state = self.inner.write();
        state.closed = true;
        state.clients.drain().map(|(_, client)| client).collect()
    }

    /// Look up a client by id, taking a new reference
    ///
    /// Returns `None` for unknown ids and always after the service closed.
    pub(crate) fn lookup(&self, id: ClientId) -> Option<Client> {
        self.inner.read().clients.get(&id).cloned()
    }

    /// Number of registered clients
    pub(crate) fn count(&self) -> usize {
        self.inner.read().clients.len()
    }
}
