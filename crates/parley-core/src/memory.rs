//! In-memory implementations of the service ports.
//!
//! Used by the server when no external services are wired in, and by tests.

use crate::services::{
    Exchange, ExchangeService, ExchangeStatus, MessageStore, NewMessage, ServiceError,
    StoredMessage, UserDirectory, UserProfile,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parley_protocol::{ExchangeId, UserId};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;
use uuid::Uuid;

/// Exchanges held in a map.
#[derive(Debug, Default)]
pub struct MemoryExchangeService {
    exchanges: DashMap<ExchangeId, Exchange>,
}

impl MemoryExchangeService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an exchange.
    pub fn insert(&self, exchange: Exchange) {
        self.exchanges.insert(exchange.id, exchange);
    }

    /// Change the status of an exchange. Returns `false` if it is unknown.
    pub fn set_status(&self, exchange_id: ExchangeId, status: ExchangeStatus) -> bool {
        match self.exchanges.get_mut(&exchange_id) {
            Some(mut exchange) => {
                exchange.status = status;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ExchangeService for MemoryExchangeService {
    async fn get(&self, exchange_id: ExchangeId) -> Result<Option<Exchange>, ServiceError> {
        Ok(self.exchanges.get(&exchange_id).map(|e| e.clone()))
    }
}

/// Users held in a map.
#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    users: DashMap<UserId, UserProfile>,
}

impl MemoryUserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: UserProfile) {
        self.users.insert(profile.id, profile);
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn resolve(&self, user_id: UserId) -> Result<Option<UserProfile>, ServiceError> {
        Ok(self.users.get(&user_id).map(|u| u.clone()))
    }
}

/// Messages held per exchange in insertion order.
///
/// Availability can be switched off to simulate an unreachable store.
#[derive(Debug)]
pub struct MemoryMessageStore {
    messages: DashMap<ExchangeId, Vec<StoredMessage>>,
    available: AtomicBool,
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self {
            messages: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`ServiceError::Unavailable`] while `false`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored messages for an exchange.
    #[must_use]
    pub fn count(&self, exchange_id: ExchangeId) -> usize {
        self.messages
            .get(&exchange_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), ServiceError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ServiceError::unavailable("message store", "store offline"))
        }
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create(&self, message: NewMessage) -> Result<StoredMessage, ServiceError> {
        self.check_available()?;

        let stored = StoredMessage {
            id: Uuid::new_v4(),
            exchange_id: message.exchange_id,
            sender_id: message.sender_id,
            sealed: message.sealed,
            created_at: Utc::now(),
            is_read: false,
        };

        self.messages
            .entry(stored.exchange_id)
            .or_default()
            .push(stored.clone());
        trace!(exchange = stored.exchange_id, message = %stored.id, "Stored message");

        Ok(stored)
    }

    async fn bulk_mark_read(
        &self,
        exchange_id: ExchangeId,
        reader_id: UserId,
    ) -> Result<u64, ServiceError> {
        self.check_available()?;

        let mut count = 0;
        if let Some(mut messages) = self.messages.get_mut(&exchange_id) {
            for message in messages.iter_mut() {
                if message.sender_id != reader_id && !message.is_read {
                    message.is_read = true;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn query(
        &self,
        exchange_id: ExchangeId,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, ServiceError> {
        self.check_available()?;

        Ok(self
            .messages
            .get(&exchange_id)
            .map(|messages| {
                let start = messages.len().saturating_sub(limit);
                messages[start..].to_vec()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::SealedText;

    fn new_message(exchange_id: ExchangeId, sender_id: UserId) -> NewMessage {
        NewMessage {
            exchange_id,
            sender_id,
            sealed: SealedText {
                ciphertext: vec![1, 2, 3],
                iv: vec![0; 12],
                auth_tag: vec![0; 16],
            },
        }
    }

    #[tokio::test]
    async fn test_bulk_mark_read_skips_own_messages() {
        let store = MemoryMessageStore::new();
        store.create(new_message(42, 1)).await.unwrap();
        store.create(new_message(42, 1)).await.unwrap();
        store.create(new_message(42, 2)).await.unwrap();

        assert_eq!(store.bulk_mark_read(42, 2).await.unwrap(), 2);
        assert_eq!(store.bulk_mark_read(42, 2).await.unwrap(), 0);
        assert_eq!(store.bulk_mark_read(42, 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_query_returns_newest_oldest_first() {
        let store = MemoryMessageStore::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.create(new_message(7, 1)).await.unwrap().id);
        }

        let page = store.query(7, 2).await.unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), ids[3..].to_vec());
        assert!(store.query(8, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryMessageStore::new();
        store.set_available(false);
        assert!(store.create(new_message(1, 1)).await.is_err());
        assert_eq!(store.count(1), 0);

        store.set_available(true);
        assert!(store.create(new_message(1, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_exchange_status_update() {
        let service = MemoryExchangeService::new();
        service.insert(Exchange {
            id: 42,
            requester_id: 1,
            provider_id: 2,
            status: ExchangeStatus::Accepted,
        });

        assert!(service.set_status(42, ExchangeStatus::Cancelled));
        assert!(!service.set_status(43, ExchangeStatus::Cancelled));
        let exchange = service.get(42).await.unwrap().unwrap();
        assert!(exchange.status.is_terminal());
    }
}
