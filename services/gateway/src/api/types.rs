//! HTTP API request/response types.
//!
//! # Purpose
//! Defines the JSON payload shapes of the gateway control API and the schemas
//! published in the OpenAPI document. Field names are camelCase on the wire.
//!
//! # Notes
//! Request fields are optional at the serde level so that a missing field is
//! reported by the handler as a validation error instead of a decode failure.
use crate::model::StoredMessage;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureRequest {
    pub broker_url: Option<String>,
    /// Client options: `username`, `password`, `keepalive`, `clean`,
    /// `clientId`, `qos`, `connectTimeout`, `reconnectPeriod`.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub options: serde_json::Value,
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct TopicRequest {
    pub client_id: Option<String>,
    pub topic: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct CloseRequest {
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, IntoParams, Clone, Default)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ClientQuery {
    /// Client identifier.
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, IntoParams, Clone, Default)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct MessagesQuery {
    /// Client identifier.
    pub client_id: Option<String>,
    /// Exact topic the messages were published on.
    pub topic: Option<String>,
    /// Maximum number of messages to return (default 100).
    pub limit: Option<usize>,
    /// Only return messages with a sequence number greater than this.
    pub after: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    pub connected_clients: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// One stored message as returned by `GET /messages`.
///
/// `payload` is the UTF-8 rendering (lossy); `payloadBase64` carries the exact
/// bytes.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub seq: u64,
    pub topic: String,
    pub payload: String,
    pub payload_base64: String,
    pub received_at: DateTime<Utc>,
}

impl From<StoredMessage> for MessageView {
    fn from(message: StoredMessage) -> Self {
        Self {
            seq: message.seq,
            topic: message.topic,
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            payload_base64: STANDARD.encode(&message.payload),
            received_at: message.received_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MessageListResponse {
    pub client_id: String,
    pub topic: String,
    pub items: Vec<MessageView>,
    /// Cursor for the next page; absent when this page was not full.
    pub next_after: Option<u64>,
}
