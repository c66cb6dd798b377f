//! Connection registry.
//!
//! Tracks every live connection, the user it is bound to, the rooms it has
//! joined, and the queue its outbound frames go through.

use crate::error::{RelayError, RelayResult};
use crate::services::UserProfile;
use dashmap::DashMap;
use parley_protocol::{ExchangeId, ServerFrame, UserId};
use std::collections::HashSet;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Queue feeding frames to one connection's socket.
pub type Outbox = mpsc::UnboundedSender<ServerFrame>;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

struct ConnectionEntry {
    user: Option<UserProfile>,
    outbox: Outbox,
    rooms: HashSet<ExchangeId>,
}

/// Registry of live connections.
#[derive(Default)]
pub struct Registry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// user_id -> live connections bound to that user.
    users: DashMap<UserId, HashSet<ConnectionId>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new, unauthenticated connection.
    pub fn register(&self, outbox: Outbox) -> ConnectionId {
        let id = ConnectionId::generate();
        self.connections.insert(
            id.clone(),
            ConnectionEntry {
                user: None,
                outbox,
                rooms: HashSet::new(),
            },
        );
        debug!(connection = %id, "Connection registered");
        id
    }

    /// Bind a connection to a user, replacing any earlier binding.
    ///
    /// Returns the previously bound profile, if any.
    pub fn bind(&self, connection_id: &ConnectionId, profile: UserProfile) -> Option<UserProfile> {
        let user_id = profile.id;
        let previous = {
            let mut entry = self.connections.get_mut(connection_id)?;
            entry.user.replace(profile)
        };

        if let Some(prev) = &previous {
            if prev.id != user_id {
                self.unindex_user(prev.id, connection_id);
            }
        }
        self.users
            .entry(user_id)
            .or_default()
            .insert(connection_id.clone());

        debug!(connection = %connection_id, user = user_id, "Connection authenticated");
        previous
    }

    /// The identity bound to a connection.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotAuthenticated`] if the connection is unknown
    /// or has not authenticated.
    pub fn identity(&self, connection_id: &ConnectionId) -> RelayResult<UserProfile> {
        self.connections
            .get(connection_id)
            .and_then(|entry| entry.user.clone())
            .ok_or(RelayError::NotAuthenticated)
    }

    /// Queue a frame for one connection. Returns `false` if it is gone.
    pub fn send(&self, connection_id: &ConnectionId, frame: ServerFrame) -> bool {
        match self.connections.get(connection_id) {
            Some(entry) => entry.outbox.send(frame).is_ok(),
            None => false,
        }
    }

    /// Outbound queues of every live connection bound to a user.
    #[must_use]
    pub fn outboxes_for_user(&self, user_id: UserId) -> Vec<Outbox> {
        let Some(ids) = self.users.get(&user_id).map(|ids| ids.clone()) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.connections.get(id).map(|e| e.outbox.clone()))
            .collect()
    }

    /// Queue a frame for every live connection of a user.
    ///
    /// Returns the number of connections reached.
    pub fn send_to_user(&self, user_id: UserId, frame: &ServerFrame) -> usize {
        let delivered = self
            .outboxes_for_user(user_id)
            .into_iter()
            .filter(|outbox| outbox.send(frame.clone()).is_ok())
            .count();
        trace!(user = user_id, recipients = delivered, "Sent to user");
        delivered
    }

    /// Record that a connection joined a room.
    pub fn add_room(&self, connection_id: &ConnectionId, exchange_id: ExchangeId) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.rooms.insert(exchange_id);
        }
    }

    /// Record that a connection left a room. Returns `true` if it was in it.
    pub fn remove_room(&self, connection_id: &ConnectionId, exchange_id: ExchangeId) -> bool {
        self.connections
            .get_mut(connection_id)
            .map(|mut entry| entry.rooms.remove(&exchange_id))
            .unwrap_or(false)
    }

    /// Whether the connection has joined a room.
    #[must_use]
    pub fn in_room(&self, connection_id: &ConnectionId, exchange_id: ExchangeId) -> bool {
        self.connections
            .get(connection_id)
            .map(|entry| entry.rooms.contains(&exchange_id))
            .unwrap_or(false)
    }

    /// Rooms a connection has joined.
    #[must_use]
    pub fn rooms(&self, connection_id: &ConnectionId) -> Vec<ExchangeId> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.rooms.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Remove a connection entirely.
    ///
    /// Returns the user it was bound to, if any.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<UserProfile> {
        let (_, entry) = self.connections.remove(connection_id)?;
        if let Some(user) = &entry.user {
            self.unindex_user(user.id, connection_id);
        }
        debug!(connection = %connection_id, "Connection unregistered");
        entry.user
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether a user has at least one live connection.
    #[must_use]
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.users.contains_key(&user_id)
    }

    fn unindex_user(&self, user_id: UserId, connection_id: &ConnectionId) {
        self.users.remove_if_mut(&user_id, |_, ids| {
            ids.remove(connection_id);
            ids.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: UserId) -> UserProfile {
        UserProfile {
            id,
            name: format!("user-{id}"),
        }
    }

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_unauthenticated_identity() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = registry.register(tx);

        assert!(matches!(
            registry.identity(&conn),
            Err(RelayError::NotAuthenticated)
        ));
        assert!(matches!(
            registry.identity(&ConnectionId::from("missing")),
            Err(RelayError::NotAuthenticated)
        ));
    }

    #[test]
    fn test_rebind_moves_user_index() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = registry.register(tx);

        assert!(registry.bind(&conn, profile(1)).is_none());
        assert!(registry.is_online(1));

        let previous = registry.bind(&conn, profile(2)).unwrap();
        assert_eq!(previous.id, 1);
        assert!(!registry.is_online(1));
        assert!(registry.is_online(2));
        assert_eq!(registry.identity(&conn).unwrap().id, 2);
    }

    #[test]
    fn test_send_to_user_fans_out() {
        let registry = Registry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let a = registry.register(tx1);
        let b = registry.register(tx2);
        registry.bind(&a, profile(2));
        registry.bind(&b, profile(2));

        let frame = ServerFrame::Pong { timestamp: None };
        assert_eq!(registry.send_to_user(2, &frame), 2);
        assert_eq!(registry.send_to_user(3, &frame), 0);
        assert_eq!(rx1.try_recv().unwrap(), frame);
        assert_eq!(rx2.try_recv().unwrap(), frame);
    }

    #[test]
    fn test_unregister_cleans_up() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = registry.register(tx);
        registry.bind(&conn, profile(1));
        registry.add_room(&conn, 42);
        assert!(registry.in_room(&conn, 42));
        assert_eq!(registry.rooms(&conn), vec![42]);

        assert_eq!(registry.unregister(&conn).unwrap().id, 1);
        assert!(!registry.is_online(1));
        assert_eq!(registry.connection_count(), 0);
        assert!(!registry.send(&conn, ServerFrame::Pong { timestamp: None }));
    }
}
