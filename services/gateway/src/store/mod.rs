//! Durable state for the session gateway.
//!
//! # Purpose
//! Defines the subscription and message store contracts used by the session
//! registry, with in-memory and Postgres implementations.
//!
//! # Notes
//! Both contracts must be idempotent and safe under concurrent calls for the
//! same client id from one process. No cross-process transactions are assumed.
use crate::model::{StoredMessage, SubscriptionRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub const DEFAULT_MESSAGES_LIMIT: usize = 1000;
pub const DEFAULT_MEMORY_LOG_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Upper bound on rows returned by a single message listing.
    pub messages_limit: usize,
    /// Messages kept per log by the in-memory backend; the oldest are evicted.
    pub memory_log_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            messages_limit: DEFAULT_MESSAGES_LIMIT,
            memory_log_capacity: DEFAULT_MEMORY_LOG_CAPACITY,
        }
    }
}

impl StoreConfig {
    pub fn clamp_limit(&self, requested: usize) -> usize {
        requested.clamp(1, self.messages_limit.max(1))
    }
}

/// Inbound publish handed to [`MessageStore::append_message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub client_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Read the durable record for `client_id`, `None` if it was never written.
    async fn get_subscriptions(&self, client_id: &str) -> StoreResult<Option<SubscriptionRecord>>;
    /// Upsert the record and add `topic` to its set. Duplicate adds are no-ops.
    async fn add_subscription(&self, client_id: &str, topic: &str) -> StoreResult<()>;
    /// Remove `topic` from the set. Missing records and non-members are no-ops.
    async fn remove_subscription(&self, client_id: &str, topic: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append to the `(client_id, topic)` log, creating it on first use.
    async fn append_message(&self, message: NewMessage) -> StoreResult<StoredMessage>;
    /// Read up to `limit` messages of one log in arrival order, starting after
    /// sequence number `after` when given.
    async fn list_messages(
        &self,
        client_id: &str,
        topic: &str,
        after: Option<u64>,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>>;
}

#[async_trait]
pub trait GatewayStore: SubscriptionStore + MessageStore {
    async fn health_check(&self) -> StoreResult<()>;
    fn is_durable(&self) -> bool;
    fn backend_name(&self) -> &'static str;
}
