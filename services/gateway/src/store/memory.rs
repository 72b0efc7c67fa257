//! In-memory implementation of the gateway stores.
//!
//! # Purpose
//! Implements [`SubscriptionStore`] and [`MessageStore`] with `HashMap`s guarded
//! by `tokio::sync::RwLock`. It exists for:
//! - local development and tests (no external dependencies)
//! - deployments where durability is not required
//!
//! # Durability and consistency
//! - **Not durable**: all state is lost on process restart, so the resubscribe
//!   pass only ever sees records written by the current process.
//! - **Single-process consistency**: mutations take a write lock, reads a read lock.
//!
//! # Message logs
//! Each `(client_id, topic)` pair owns one append-only log created on first
//! append. Sequence numbers are assigned under the write lock, so they follow
//! the order in which appends reach the store. A log keeps at most
//! `memory_log_capacity` messages; appending to a full log evicts the oldest
//! one (`gateway_messages_evicted_total`). Sequence numbers are never reused.
use super::{
    GatewayStore, MessageStore, NewMessage, StoreConfig, StoreResult, SubscriptionStore,
};
use crate::model::{StoredMessage, SubscriptionRecord};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

type LogKey = (String, String);

#[derive(Debug, Default)]
struct MessageLog {
    next_seq: u64,
    items: VecDeque<StoredMessage>,
}

impl MessageLog {
    fn append(&mut self, message: NewMessage, capacity: usize) -> StoredMessage {
        let stored = StoredMessage {
            seq: self.next_seq,
            client_id: message.client_id,
            topic: message.topic,
            payload: message.payload,
            received_at: message.received_at,
        };
        self.next_seq += 1;
        while self.items.len() >= capacity.max(1) {
            self.items.pop_front();
            metrics::counter!("gateway_messages_evicted_total").increment(1);
        }
        self.items.push_back(stored.clone());
        stored
    }

    fn page(&self, after: Option<u64>, limit: usize) -> Vec<StoredMessage> {
        let start = match after {
            Some(after) => self.items.partition_point(|item| item.seq <= after),
            None => 0,
        };
        self.items.range(start..).take(limit).cloned().collect()
    }
}

#[derive(Clone)]
pub struct InMemoryStore {
    config: StoreConfig,
    /// Durable-equivalent subscription records keyed by `client_id`.
    subscriptions: Arc<RwLock<HashMap<String, SubscriptionRecord>>>,
    /// Message logs keyed by the raw `(client_id, topic)` pair.
    messages: Arc<RwLock<HashMap<LogKey, MessageLog>>>,
}

impl InMemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            messages: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of message logs created so far.
    pub async fn log_count(&self) -> usize {
        self.messages.read().await.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn get_subscriptions(&self, client_id: &str) -> StoreResult<Option<SubscriptionRecord>> {
        Ok(self.subscriptions.read().await.get(client_id).cloned())
    }

    async fn add_subscription(&self, client_id: &str, topic: &str) -> StoreResult<()> {
        let mut records = self.subscriptions.write().await;
        records
            .entry(client_id.to_string())
            .or_insert_with(|| SubscriptionRecord::new(client_id))
            .add(topic);
        Ok(())
    }

    async fn remove_subscription(&self, client_id: &str, topic: &str) -> StoreResult<()> {
        let mut records = self.subscriptions.write().await;
        if let Some(record) = records.get_mut(client_id) {
            record.remove(topic);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn append_message(&self, message: NewMessage) -> StoreResult<StoredMessage> {
        let key = (message.client_id.clone(), message.topic.clone());
        let mut logs = self.messages.write().await;
        let stored = logs
            .entry(key)
            .or_default()
            .append(message, self.config.memory_log_capacity);
        metrics::gauge!("gateway_message_logs_total").set(logs.len() as f64);
        Ok(stored)
    }

    async fn list_messages(
        &self,
        client_id: &str,
        topic: &str,
        after: Option<u64>,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>> {
        let limit = self.config.clamp_limit(limit);
        let logs = self.messages.read().await;
        let key = (client_id.to_string(), topic.to_string());
        Ok(logs
            .get(&key)
            .map(|log| log.page(after, limit))
            .unwrap_or_default())
    }
}

#[async_trait]
impl GatewayStore for InMemoryStore {
    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
