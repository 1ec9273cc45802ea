//! Session registry: which users are online, and on which connections.
//!
//! `DashMap<UserId, Arc<ChannelSet>>`, where each channel set is a
//! mutex-guarded `Vec` of that user's live connections. A user's set is
//! created on first registration and pruned when its last connection
//! deregisters. Registration pushes while holding the map entry (shard write
//! lock) and pruning uses `remove_if`, which takes the same lock, so a new
//! connection can never land in a set that is being pruned.
//!
//! No lock in this module is ever held across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tracing::debug;

use crate::connection::{Connection, ConnectionId, UserId};

/// The live connections belonging to one user.
pub struct ChannelSet {
    user_id: UserId,
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl ChannelSet {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Connection>>> {
        // push and retain never leave the Vec half-mutated, so poisoning is harmless.
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns `false` if this connection id is already present.
    fn insert(&self, conn: Arc<Connection>) -> bool {
        let mut conns = self.lock();
        if conns.iter().any(|c| c.id() == conn.id()) {
            return false;
        }
        conns.push(conn);
        true
    }

    fn remove(&self, id: ConnectionId) -> bool {
        let mut conns = self.lock();
        let before = conns.len();
        conns.retain(|c| c.id() != id);
        conns.len() != before
    }

    /// Point-in-time copy for fan-out.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Process-wide map from user to live connections.
///
/// Constructed once at server start and shared through `AppState`.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<UserId, Arc<ChannelSet>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` under its user, creating the user's set if needed.
    /// Registering the same connection twice is a no-op.
    pub fn register(&self, conn: Arc<Connection>) {
        let user_id = conn.user_id();
        let conn_id = conn.id();
        let entry = self
            .sessions
            .entry(user_id)
            .or_insert_with(|| Arc::new(ChannelSet::new(user_id)));
        let inserted = entry.value().insert(conn);
        let count = entry.value().len();
        drop(entry);

        if inserted {
            debug!(
                user_id = %user_id,
                connection_id = %conn_id,
                connections = count,
                "connection registered"
            );
        } else {
            debug!(
                user_id = %user_id,
                connection_id = %conn_id,
                "duplicate registration ignored"
            );
        }
    }

    /// Remove a connection by identity. Absent users or connections are a
    /// no-op. Never touches the transport.
    pub fn deregister(&self, user_id: UserId, conn_id: ConnectionId) -> bool {
        let removed = match self.sessions.get(&user_id) {
            Some(set) => set.remove(conn_id),
            None => false,
        };

        let pruned = self
            .sessions
            .remove_if(&user_id, |_, set| set.is_empty())
            .is_some();

        if removed {
            debug!(
                user_id = %user_id,
                connection_id = %conn_id,
                pruned,
                "connection deregistered"
            );
        }
        removed
    }

    /// Snapshot of a user's connections, or `None` if the user has no session.
    pub fn get(&self, user_id: UserId) -> Option<Vec<Arc<Connection>>> {
        self.sessions.get(&user_id).map(|set| set.snapshot())
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.connection_count(user_id) > 0
    }

    pub fn connection_count(&self, user_id: UserId) -> usize {
        self.sessions
            .get(&user_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    pub fn online_users(&self) -> usize {
        self.sessions.len()
    }

    pub fn total_connections(&self) -> usize {
        self.sessions.iter().map(|entry| entry.value().len()).sum()
    }

    /// Every live connection across all users, for shutdown.
    pub fn snapshot_all(&self) -> Vec<Arc<Connection>> {
        self.sessions
            .iter()
            .flat_map(|entry| entry.value().snapshot())
            .collect()
    }
}
