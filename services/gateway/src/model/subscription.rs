//! Durable subscription record.
//!
//! # Purpose
//! One record per client id holding the set of topics the client should be
//! subscribed to whenever its session is (re)created.
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub client_id: String,
    pub subscriptions: Vec<String>,
}

impl SubscriptionRecord {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            subscriptions: Vec::new(),
        }
    }

    /// Add a topic with set semantics. Returns `false` if it was already present.
    pub fn add(&mut self, topic: &str) -> bool {
        if self.contains(topic) {
            return false;
        }
        self.subscriptions.push(topic.to_string());
        true
    }

    /// Remove a topic if present. Returns `false` if it was not a member.
    pub fn remove(&mut self, topic: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|existing| existing != topic);
        before != self.subscriptions.len()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.subscriptions.iter().any(|existing| existing == topic)
    }
}
