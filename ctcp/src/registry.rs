//! Table of live connections.
//!
//! The table lock is held only to insert, remove or snapshot handles. It is
//! never held while a connection lock is taken or an endpoint is called.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{CtcpError, Result};

/// Type alias for connection identifiers.
pub type ConnId = u64;

pub(crate) struct RegistryInner {
    connections: RwLock<HashMap<ConnId, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl RegistryInner {
    pub(crate) fn remove(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.connections.write().remove(&id)
    }
}

/// Shared handle to the connection table. Clones refer to the same table.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Create and register a connection over `endpoint`.
    pub fn create(
        &self,
        endpoint: Arc<dyn Endpoint>,
        config: ConnectionConfig,
    ) -> Result<Arc<Connection>> {
        config.validate()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(
            id,
            endpoint,
            config,
            Arc::downgrade(&self.inner),
        ));
        self.inner.connections.write().insert(id, Arc::clone(&conn));
        info!(conn = id, "connection created");
        Ok(conn)
    }

    pub fn get(&self, id: ConnId) -> Result<Arc<Connection>> {
        self.inner
            .connections
            .read()
            .get(&id)
            .cloned()
            .ok_or(CtcpError::ConnectionNotFound(id))
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.inner.connections.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.read().is_empty()
    }

    /// Handles to every registered connection, in id order.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut conns: Vec<_> = self.inner.connections.read().values().cloned().collect();
        conns.sort_by_key(|c| c.id());
        conns
    }

    /// Destroy a registered connection.
    pub fn destroy(&self, id: ConnId) -> Result<()> {
        let conn = self.get(id)?;
        conn.destroy();
        Ok(())
    }

    /// Destroy every registered connection.
    pub fn shutdown(&self) {
        let conns = self.snapshot();
        let count = conns.len();
        for conn in conns {
            conn.destroy();
        }
        info!(count, "registry shut down");
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
