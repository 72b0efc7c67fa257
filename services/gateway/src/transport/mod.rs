//! Downstream MQTT transport abstraction.
//!
//! # Purpose
//! The session registry drives each client session through two traits:
//! [`TransportConnector`] opens a connection and [`SessionTransport`] issues
//! subscribe/unsubscribe/close on it. Everything that happens after the initial
//! connect (reconnects, closes, inbound publishes) is reported as
//! [`TransportEvent`]s on the channel handed to `connect`.
//!
//! # Implementations
//! - [`mqtt::MqttConnector`]: real broker connections via `rumqttc`.
//! - [`loopback::LoopbackConnector`]: in-process broker stand-in for tests and
//!   local development.
//!
//! # Event queue
//! Lifecycle events travel on an unbounded queue; there are at most a handful
//! per reconnect. Inbound publishes travel on a bounded queue of
//! [`EVENT_QUEUE_CAPACITY`] entries and are dropped (and counted in
//! `gateway_inbound_dropped_total`) when the session's router falls behind.
//! The receiver drains queued publishes before the next lifecycle event.
//!
//! # Notes
//! No timeout is applied to subscribe/unsubscribe here; each implementation
//! inherits its client's defaults.
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub mod loopback;
pub mod mqtt;

/// Connection parameters for one session. Immutable for the session lifetime.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub client_id: String,
    pub broker_url: String,
    /// Opaque client options (credentials, keep-alive, clean-session flag, ...).
    pub options: serde_json::Value,
}

/// Asynchronous notifications emitted after a successful initial connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection was re-established after a loss.
    Connected,
    /// The connection was lost and the transport is retrying.
    Reconnecting,
    /// The transport stopped for good; no further events follow.
    Closed,
    /// An inbound publish on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
}

/// Inbound publishes buffered per session before new ones are dropped.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Create the event queue for one session.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
    let (messages_tx, messages_rx) = mpsc::channel(capacity.max(1));
    (
        EventSender {
            lifecycle: lifecycle_tx,
            messages: messages_tx,
        },
        EventReceiver {
            lifecycle: lifecycle_rx,
            messages: messages_rx,
        },
    )
}

#[derive(Debug, Clone)]
pub struct EventSender {
    lifecycle: mpsc::UnboundedSender<TransportEvent>,
    messages: mpsc::Sender<TransportEvent>,
}

impl EventSender {
    /// Queue an event without waiting. Returns `false` once the receiver is gone.
    ///
    /// A publish that finds the message queue full is dropped and counted; the
    /// call still returns `true`.
    pub fn send(&self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Message { .. } => match self.messages.try_send(event) {
                Ok(()) => true,
                Err(TrySendError::Full(TransportEvent::Message { topic, .. })) => {
                    metrics::counter!("gateway_inbound_dropped_total").increment(1);
                    tracing::warn!(topic = %topic, "inbound queue full, dropping message");
                    true
                }
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => false,
            },
            event => self.lifecycle.send(event).is_ok(),
        }
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    lifecycle: mpsc::UnboundedReceiver<TransportEvent>,
    messages: mpsc::Receiver<TransportEvent>,
}

impl EventReceiver {
    /// Next event, or `None` once every sender is gone and both queues are empty.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        tokio::select! {
            biased;
            Some(event) = self.messages.recv() => Some(event),
            Some(event) = self.lifecycle.recv() => Some(event),
            else => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid broker endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("invalid connection options: {0}")]
    InvalidOptions(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("broker rejected subscription to {0}")]
    SubscribeRejected(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("session is not connected yet")]
    NotReady,
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether the failure was caused by caller input rather than the broker.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TransportError::InvalidEndpoint(_) | TransportError::InvalidOptions(_)
        )
    }
}

#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Subscribe and resolve once the broker acknowledged the request.
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
    /// Unsubscribe and resolve once the broker acknowledged the request.
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
    /// Disconnect. Emits [`TransportEvent::Closed`] on the session's channel.
    async fn close(&self);
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Open a connection and resolve on the first successful connect.
    ///
    /// # Errors
    /// - Malformed endpoint or options.
    /// - Refused or failed initial connection.
    async fn connect(
        &self,
        request: ConnectRequest,
        events: EventSender,
    ) -> Result<Arc<dyn SessionTransport>, TransportError>;
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(level)) if expected == level => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
