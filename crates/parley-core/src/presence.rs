//! Presence and typing tracking for a room.
//!
//! Presence is kept per connection: one user may have several tabs or
//! devices in the same room. Everything the room broadcasts is aggregated
//! per user, so a user is online while any connection is present and typing
//! while any connection is typing.

use crate::registry::ConnectionId;
use crate::services::UserProfile;
use chrono::{DateTime, Utc};
use parley_protocol::{UserId, UserSummary};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Presence state for a single connection.
#[derive(Debug, Clone)]
pub struct MemberState {
    pub connection_id: ConnectionId,
    pub user: UserProfile,
    pub joined_at: DateTime<Utc>,
    pub typing: bool,
}

/// Presence tracker for a room.
#[derive(Debug, Default)]
pub struct Presence {
    members: HashMap<ConnectionId, MemberState>,
}

impl Presence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of present connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Check if a connection is present.
    #[must_use]
    pub fn is_present(&self, connection_id: &ConnectionId) -> bool {
        self.members.contains_key(connection_id)
    }

    /// Whether any connection of the user is present.
    #[must_use]
    pub fn has_user(&self, user_id: UserId) -> bool {
        self.members.values().any(|m| m.user.id == user_id)
    }

    /// Add a connection.
    ///
    /// Returns `true` if this is a new member, `false` if it was present.
    pub fn join(&mut self, connection_id: ConnectionId, user: UserProfile) -> bool {
        if self.members.contains_key(&connection_id) {
            return false;
        }

        debug!(connection = %connection_id, user = user.id, "Presence: member joined");
        self.members.insert(
            connection_id.clone(),
            MemberState {
                connection_id,
                user,
                joined_at: Utc::now(),
                typing: false,
            },
        );
        true
    }

    /// Remove a connection.
    ///
    /// Returns the removed state, if any.
    pub fn leave(&mut self, connection_id: &ConnectionId) -> Option<MemberState> {
        let state = self.members.remove(connection_id);
        if state.is_some() {
            debug!(connection = %connection_id, "Presence: member left");
        }
        state
    }

    /// Set the typing flag of a connection.
    ///
    /// Returns `Some(typing)` when the user-level typing state changed and
    /// should be broadcast, `None` otherwise (including unknown connections).
    pub fn set_typing(&mut self, connection_id: &ConnectionId, typing: bool) -> Option<bool> {
        let user_id = self.members.get(connection_id)?.user.id;
        let before = self.is_user_typing(user_id);

        if let Some(member) = self.members.get_mut(connection_id) {
            member.typing = typing;
        }

        let after = self.is_user_typing(user_id);
        (before != after).then_some(after)
    }

    /// Whether any connection of the user is typing.
    #[must_use]
    pub fn is_user_typing(&self, user_id: UserId) -> bool {
        self.members
            .values()
            .any(|m| m.user.id == user_id && m.typing)
    }

    /// Distinct users with at least one present connection, ordered by id.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserSummary> {
        let users: BTreeMap<UserId, UserSummary> = self
            .members
            .values()
            .map(|m| (m.user.id, m.user.summary()))
            .collect();
        users.into_values().collect()
    }

    /// All present connection IDs.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.members.keys().cloned().collect()
    }

    /// The member state of a connection.
    #[must_use]
    pub fn get(&self, connection_id: &ConnectionId) -> Option<&MemberState> {
        self.members.get(connection_id)
    }
}
