//! Identity → connection registry used to route pushes and call signals.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::connection::ClientConnection;
use crate::protocol::ServerEvent;

/// Maps each logged-in identity to exactly one live connection.
///
/// Every operation takes the lock for its own duration only; callers must
/// never hold a returned guard across an `.await`.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<String, Arc<ClientConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `identity` to `connection`, returning the connection it replaced.
    ///
    /// The replaced connection is left open; detaching it is up to the caller.
    pub fn bind(
        &self,
        identity: &str,
        connection: Arc<ClientConnection>,
    ) -> Option<Arc<ClientConnection>> {
        let previous = self
            .entries
            .write()
            .insert(identity.to_string(), connection);
        if let Some(prev) = &previous {
            debug!(identity, old_conn = %prev.id, "identity rebound");
        }
        previous
    }

    pub fn lookup(&self, identity: &str) -> Option<Arc<ClientConnection>> {
        self.entries.read().get(identity).cloned()
    }

    /// Remove `identity` only while it is still bound to `connection_id`.
    ///
    /// A stale disconnect for an identity that has since logged in again on
    /// another connection leaves the newer binding intact.
    pub fn unbind(&self, identity: &str, connection_id: &str) -> bool {
        let mut entries = self.entries.write();
        match entries.get(identity) {
            Some(current) if current.id == connection_id => {
                let _ = entries.remove(identity);
                true
            }
            Some(current) => {
                debug!(identity, conn_id = connection_id, bound_to = %current.id, "stale unbind ignored");
                false
            }
            None => false,
        }
    }

    /// Deliver `event` to every bound connection matching `predicate`.
    ///
    /// Returns the number of connections that accepted the event.
    pub fn broadcast<F>(&self, predicate: F, event: &ServerEvent) -> usize
    where
        F: Fn(&ClientConnection) -> bool,
    {
        let targets: Vec<Arc<ClientConnection>> = self
            .entries
            .read()
            .values()
            .filter(|conn| predicate(conn))
            .cloned()
            .collect();

        let mut delivered = 0;
        for conn in targets {
            if conn.send(event.clone()) {
                delivered += 1;
            } else {
                warn!(conn_id = %conn.id, event = event.name(), "delivery to closing connection skipped");
            }
        }
        delivered
    }

    pub fn identities(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
