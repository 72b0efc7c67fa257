//! Session model definitions.
//!
//! # Purpose
//! Defines the connection lifecycle of a managed MQTT client session and the
//! read-only view returned by the HTTP API.
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Lifecycle state of one downstream MQTT connection.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub client_id: String,
    pub broker_url: String,
    pub state: ConnectionState,
    pub subscriptions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_serializes_camel_case() {
        let value = serde_json::to_value(ConnectionState::Reconnecting).expect("serialize");
        assert_eq!(value, serde_json::json!("reconnecting"));
        assert_eq!(ConnectionState::Closed.as_str(), "closed");
    }
}
