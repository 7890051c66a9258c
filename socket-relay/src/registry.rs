//! Ordered registry of live connections.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;

use crate::connection::{Connection, ConnectionId};

/// Live connections keyed by id.
///
/// Ids come from a monotonically increasing counter, so iterating the map
/// visits connections oldest first. Routing relies on that order.
pub struct ConnectionRegistry {
    connections: RwLock<BTreeMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates an id that this registry never hands out again.
    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, connection: Arc<Connection>) {
        self.connections.write().insert(connection.id(), connection);
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.write().remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// Point-in-time copy of the live connections, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Oldest connection whose name matches `target`, ignoring case.
    pub fn find_by_name(&self, target: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .values()
            .find(|connection| connection.name_matches(target))
            .cloned()
    }

    pub fn first(&self) -> Option<Arc<Connection>> {
        self.connections.read().values().next().cloned()
    }

    /// Empties the registry, handing back everything that was in it.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let drained = std::mem::take(&mut *self.connections.write());
        drained.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
