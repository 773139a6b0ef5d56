//! Registry of identified clients.
//!
//! Maps each registered [`ClientId`] to the connection currently bound to
//! it. Each identifier maps to at most one connection; registering again
//! replaces the previous binding.

use std::sync::Arc;

use dashmap::DashMap;
use parley_core::{ClientId, ConnectionId};
use tracing::{debug, warn};

use crate::connection::ClientConnection;
use crate::errors::{Result, SignalingError};

/// Concurrent map from client identifier to live connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: DashMap<ClientId, Arc<ClientConnection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `id` to `connection`, returning the connection it replaced.
    pub fn register(
        &self,
        id: ClientId,
        connection: Arc<ClientConnection>,
    ) -> Option<Arc<ClientConnection>> {
        let previous = self.clients.insert(id.clone(), connection);
        if let Some(ref old) = previous {
            debug!(client_id = %id, replaced = %old.id(), "registration replaced");
        }
        previous
    }

    /// Connection currently bound to `id`.
    pub fn lookup(&self, id: &ClientId) -> Option<Arc<ClientConnection>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove `id` unconditionally.
    pub fn remove(&self, id: &ClientId) -> Option<Arc<ClientConnection>> {
        self.clients.remove(id).map(|(_, conn)| conn)
    }

    /// Remove `id` only while it still maps to `connection_id`.
    ///
    /// A connection that has been superseded by a newer registration under
    /// the same identifier must not evict its replacement when it closes.
    pub fn remove_if_current(&self, id: &ClientId, connection_id: &ConnectionId) -> bool {
        self.clients
            .remove_if(id, |_, conn| conn.id() == connection_id)
            .is_some()
    }

    /// Queue a frame for the client registered as `id`.
    pub fn send_to(&self, id: &ClientId, frame: Arc<String>) -> Result<()> {
        let Some(conn) = self.lookup(id) else {
            return Err(SignalingError::RecipientUnavailable(id.clone()));
        };
        if conn.send(frame) {
            Ok(())
        } else {
            warn!(client_id = %id, connection_id = %conn.id(), "outbound queue refused frame");
            Err(SignalingError::RecipientUnavailable(id.clone()))
        }
    }

    /// Whether `id` is currently registered.
    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    /// Number of registered clients.
    pub fn count(&self) -> usize {
        self.clients.len()
    }
}
