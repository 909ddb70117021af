//! Connection demultiplexer.
//!
//! Tunnel packets carry a connection id; the table maps it to the virtual
//! connection that owns it and dispatches acknowledgements and data there.
//! Unknown ids are dropped. The table lock is never held while calling into a
//! connection, because `Connection::end` calls back into the tunnel, which
//! typically removes the entry from this very table.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::Connection;

/// Type alias for connection identifiers.
pub type ConnectionId = u32;

/// Live connections of one tunnel, keyed by connection id.
#[derive(Default)]
pub struct ConnectionTable {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning the one it replaced, if any.
    pub fn insert(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.connections.write().insert(conn.id(), conn)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Route an acknowledgement. Returns `false` if the id is unknown.
    pub fn dispatch_ack(&self, id: ConnectionId, seq: u32, ack: u32) -> bool {
        match self.get(id) {
            Some(conn) => {
                conn.acknowledge(seq, ack);
                true
            }
            None => {
                tracing::debug!(conn_id = id, seq, ack, "acknowledgement for unknown connection");
                false
            }
        }
    }

    /// Route a data packet. Returns `false` if the id is unknown.
    pub fn dispatch_data(&self, id: ConnectionId, seq: u32, ack: u32, payload: &[u8]) -> bool {
        match self.get(id) {
            Some(conn) => {
                conn.data(seq, ack, payload);
                true
            }
            None => {
                tracing::debug!(conn_id = id, seq, len = payload.len(), "data for unknown connection");
                false
            }
        }
    }

    /// Terminate and drop every connection that has been idle too long.
    ///
    /// Returns the ids that were reaped.
    pub fn reap_idle(&self) -> Vec<ConnectionId> {
        let idle: Vec<Arc<Connection>> = self
            .connections
            .read()
            .values()
            .filter(|conn| conn.is_timed_out())
            .cloned()
            .collect();

        let mut reaped = Vec::with_capacity(idle.len());
        for conn in idle {
            tracing::info!(conn_id = conn.id(), "connection timed out");
            conn.end();
            self.remove(conn.id());
            reaped.push(conn.id());
        }
        reaped
    }

    /// Remove entries whose connection already terminated.
    pub fn remove_terminated(&self) {
        self.connections
            .write()
            .retain(|_, conn| !conn.is_terminated());
    }

    /// Ids of all registered connections.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.read().keys().copied().collect()
    }
}
