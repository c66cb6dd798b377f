//! Ports to the systems Parley depends on but does not own.
//!
//! The exchange service decides who may enter a room, the user directory
//! names people, and the message store is the only durable state.

use crate::cipher::SealedText;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_protocol::{ExchangeId, UserId, UserSummary};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors reported by external services.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service could not be reached or timed out.
    #[error("{service} unavailable: {reason}")]
    Unavailable {
        service: &'static str,
        reason: String,
    },
}

impl ServiceError {
    /// Create an `Unavailable` error.
    pub fn unavailable(service: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            service,
            reason: reason.into(),
        }
    }
}

/// Lifecycle of an exchange as reported by the exchange service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExchangeStatus {
    Pending,
    Accepted,
    InProgress,
    Completed,
    Cancelled,
    Rejected,
}

impl ExchangeStatus {
    /// Whether the exchange is over and no longer takes messages.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExchangeStatus::Completed | ExchangeStatus::Cancelled | ExchangeStatus::Rejected
        )
    }
}

/// A proposed or running skill trade between two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exchange {
    pub id: ExchangeId,
    pub requester_id: UserId,
    pub provider_id: UserId,
    pub status: ExchangeStatus,
}

impl Exchange {
    /// The two users allowed in this exchange's room.
    #[must_use]
    pub fn participants(&self) -> [UserId; 2] {
        [self.requester_id, self.provider_id]
    }

    #[must_use]
    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.requester_id == user_id || self.provider_id == user_id
    }
}

/// A user as known to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
}

impl UserProfile {
    #[must_use]
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

/// A message about to be written.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub exchange_id: ExchangeId,
    pub sender_id: UserId,
    pub sealed: SealedText,
}

/// A message as held by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: Uuid,
    pub exchange_id: ExchangeId,
    pub sender_id: UserId,
    pub sealed: SealedText,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

/// Source of truth for exchanges and their participants.
#[async_trait]
pub trait ExchangeService: Send + Sync {
    /// Look up an exchange. `Ok(None)` means it does not exist.
    async fn get(&self, exchange_id: ExchangeId) -> Result<Option<Exchange>, ServiceError>;
}

/// Resolves user ids to display identities.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve a user. `Ok(None)` means the user is unknown.
    async fn resolve(&self, user_id: UserId) -> Result<Option<UserProfile>, ServiceError>;
}

/// Durable message storage.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message and return the committed record.
    async fn create(&self, message: NewMessage) -> Result<StoredMessage, ServiceError>;

    /// Mark every unread message of the exchange not sent by `reader_id`
    /// as read. Returns how many records changed.
    async fn bulk_mark_read(
        &self,
        exchange_id: ExchangeId,
        reader_id: UserId,
    ) -> Result<u64, ServiceError>;

    /// The newest `limit` messages of the exchange, oldest first.
    async fn query(
        &self,
        exchange_id: ExchangeId,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExchangeStatus::Pending.is_terminal());
        assert!(!ExchangeStatus::InProgress.is_terminal());
        assert!(ExchangeStatus::Cancelled.is_terminal());
        assert!(ExchangeStatus::Completed.is_terminal());
    }

    #[test]
    fn test_exchange_from_json() {
        let exchange: Exchange = serde_json::from_value(serde_json::json!({
            "id": 42,
            "requesterId": 1,
            "providerId": 2,
            "status": "inProgress"
        }))
        .unwrap();

        assert_eq!(exchange.participants(), [1, 2]);
        assert!(exchange.is_participant(2));
        assert!(!exchange.is_participant(3));
        assert_eq!(exchange.status, ExchangeStatus::InProgress);
    }
}
