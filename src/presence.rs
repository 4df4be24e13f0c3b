//! Presence tracking
//!
//! Maps a user to the set of their live connections. "Online" means at
//! least one live connection; multiple simultaneous connections per user
//! (multi-device) are normal and must not produce duplicate online or
//! offline transitions.
//!
//! Mutation happens only from the hub's control loop; reads may come
//! from anywhere, so the map sits behind a reader/writer lock as a
//! secondary index.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::hub::{ConnId, UserId};

/// Tracks which users are online via their live connections.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    users: RwLock<HashMap<UserId, HashSet<ConnId>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to the user's set.
    ///
    /// Returns true only when this is the user's first live connection,
    /// i.e. the user just transitioned from offline to online. That
    /// boolean, not the connection count, drives presence broadcasts.
    pub fn set_online(&self, user_id: UserId, conn_id: ConnId) -> bool {
        let mut users = self.users.write();
        let connections = users.entry(user_id).or_default();
        let was_offline = connections.is_empty();
        connections.insert(conn_id);
        was_offline
    }

    /// Remove a connection from the user's set.
    ///
    /// Returns true only when this removed the user's last live
    /// connection. Removing a connection that was never tracked is a
    /// safe no-op returning false.
    pub fn set_offline(&self, user_id: UserId, conn_id: ConnId) -> bool {
        let mut users = self.users.write();
        let Some(connections) = users.get_mut(&user_id) else {
            return false;
        };
        if !connections.remove(&conn_id) {
            return false;
        }
        if connections.is_empty() {
            // No dangling empty entries.
            users.remove(&user_id);
            return true;
        }
        false
    }

    /// Whether the user has at least one live connection.
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.users.read().contains_key(&user_id)
    }

    /// All users with at least one live connection, in arbitrary order.
    pub fn online_user_ids(&self) -> Vec<UserId> {
        self.users.read().keys().copied().collect()
    }

    /// Number of online users.
    pub fn online_count(&self) -> usize {
        self.users.read().len()
    }
}
