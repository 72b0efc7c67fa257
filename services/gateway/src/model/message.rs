//! Stored message model.
//!
//! # Purpose
//! Defines one persisted inbound publish and the log naming rule that maps a
//! `(client_id, topic)` pair onto its append-only message log.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One inbound publish as persisted by a message store.
///
/// `seq` is assigned by the store and increases in arrival order within a
/// single `(client_id, topic)` log.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub seq: u64,
    pub client_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Derive the log name for a `(client_id, topic)` pair.
///
/// Every character outside `[A-Za-z0-9_]` is replaced with `_`. Distinct pairs
/// may collapse onto the same name, so stores key logs by the raw pair and keep
/// this name only as a label.
pub fn message_log_name(client_id: &str, topic: &str) -> String {
    format!("{client_id}_{topic}")
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
