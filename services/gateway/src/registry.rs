//! Multi-tenant MQTT session registry.
//!
//! # Purpose
//! Owns the in-memory map of client sessions and orchestrates every session
//! operation against the session's transport and the durable stores:
//! create (with resubscribe pass), subscribe, unsubscribe, close, inbound
//! message routing, and health/inspection reads.
//!
//! # Key invariants
//! - At most one entry per `client_id`. The slot is reserved with a
//!   `Connecting` placeholder before the transport connect is issued, so a
//!   concurrent create for the same id observes it and fails as a duplicate.
//! - Subscribe/unsubscribe mutate memory only after the transport acknowledged,
//!   and touch the durable record only after memory was updated. A failure
//!   between the two leaves memory ahead of the durable record; the durable
//!   record is only read when a session is (re)created.
//! - Entries survive transport-level closes (state `Closed`); only
//!   [`SessionRegistry::close_session`] removes them.
//! - Transport reconnects do not repeat the resubscribe pass.
//!
//! # Concurrency model
//! The map lock is never held across an await on the transport or a store.
//! Each session carries a generation number so late events or acknowledgements
//! from a closed session cannot mutate a newer session with the same id.
//! Inbound messages are routed by one task per session, in arrival order.
//! Delivery and subscribe/unsubscribe are not mutually excluded: a message on
//! a topic being unsubscribed may still be stored.
use crate::model::{ConnectionState, SessionInfo};
use crate::store::{GatewayStore, NewMessage, StoreError};
use crate::transport::{
    ConnectRequest, EVENT_QUEUE_CAPACITY, EventReceiver, SessionTransport, TransportConnector,
    TransportError, TransportEvent, event_channel,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("MQTT client {0} is already configured")]
    DuplicateClient(String),
    #[error("MQTT client {0} is not configured")]
    SessionNotFound(String),
    #[error("client {client_id} is already subscribed to {topic}")]
    AlreadySubscribed { client_id: String, topic: String },
    #[error("client {client_id} is not subscribed to topic {topic}")]
    NotSubscribed { client_id: String, topic: String },
    #[error("no subscription record for client {0}")]
    NotFound(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Parameters of a configure request.
#[derive(Debug, Clone)]
pub struct CreateSession {
    pub client_id: String,
    pub broker_url: String,
    pub options: serde_json::Value,
}

/// Snapshot returned by [`SessionRegistry::health`].
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub connected_clients: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

struct SessionEntry {
    generation: u64,
    broker_url: String,
    state: ConnectionState,
    subscriptions: BTreeSet<String>,
    transport: Option<Arc<dyn SessionTransport>>,
}

struct RegistryInner {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    store: Arc<dyn GatewayStore>,
    connector: Arc<dyn TransportConnector>,
    next_generation: AtomicU64,
}

/// Authoritative registry of client sessions for this process.
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

fn required(value: &str, what: &str) -> RegistryResult<()> {
    if value.trim().is_empty() {
        return Err(RegistryError::InvalidConfiguration(format!("{what} is required")));
    }
    Ok(())
}

fn record_transition(state: ConnectionState) {
    metrics::counter!("gateway_session_state_transitions_total", "state" => state.as_str())
        .increment(1);
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn GatewayStore>, connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                store,
                connector,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Create a session and connect it.
    ///
    /// Resolves once the transport connected. The resubscribe pass then runs in
    /// the background; its per-topic failures are logged only.
    ///
    /// # Errors
    /// - `InvalidConfiguration` for a missing id/endpoint or malformed options.
    /// - `DuplicateClient` if an entry for the id exists (in any state).
    /// - `Transport` if the connect failed; the reserved slot is released.
    pub async fn create_session(&self, request: CreateSession) -> RegistryResult<()> {
        required(&request.client_id, "client id")?;
        required(&request.broker_url, "broker URL")?;
        let client_id = request.client_id.clone();

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut sessions = self.inner.sessions.write().await;
            if sessions.contains_key(&client_id) {
                return Err(RegistryError::DuplicateClient(client_id));
            }
            sessions.insert(
                client_id.clone(),
                SessionEntry {
                    generation,
                    broker_url: request.broker_url.clone(),
                    state: ConnectionState::Connecting,
                    subscriptions: BTreeSet::new(),
                    transport: None,
                },
            );
            metrics::gauge!("gateway_sessions_active").set(sessions.len() as f64);
        }
        record_transition(ConnectionState::Connecting);

        let (events_tx, events_rx) = event_channel(EVENT_QUEUE_CAPACITY);
        let connect = ConnectRequest {
            client_id: client_id.clone(),
            broker_url: request.broker_url,
            options: request.options,
        };
        let transport = match self.inner.connector.connect(connect, events_tx).await {
            Ok(transport) => transport,
            Err(err) => {
                self.release(&client_id, generation).await;
                tracing::error!(client_id = %client_id, error = %err, "MQTT configuration error");
                return Err(match err {
                    err if err.is_configuration() => {
                        RegistryError::InvalidConfiguration(err.to_string())
                    }
                    err => RegistryError::Transport(err),
                });
            }
        };

        let attached = {
            let mut sessions = self.inner.sessions.write().await;
            match sessions.get_mut(&client_id) {
                Some(entry) if entry.generation == generation => {
                    entry.transport = Some(transport.clone());
                    entry.state = ConnectionState::Connected;
                    true
                }
                _ => false,
            }
        };
        if !attached {
            transport.close().await;
            return Err(RegistryError::SessionNotFound(client_id));
        }
        record_transition(ConnectionState::Connected);
        tracing::info!(client_id = %client_id, "connected to MQTT broker");

        tokio::spawn(
            self.clone()
                .pump_events(client_id.clone(), generation, events_rx),
        );
        tokio::spawn(self.clone().resubscribe(client_id, generation, transport));
        Ok(())
    }

    async fn release(&self, client_id: &str, generation: u64) {
        let mut sessions = self.inner.sessions.write().await;
        if matches!(sessions.get(client_id), Some(entry) if entry.generation == generation) {
            sessions.remove(client_id);
        }
        metrics::gauge!("gateway_sessions_active").set(sessions.len() as f64);
    }

    /// Replay the durable subscription set onto a freshly connected session.
    async fn resubscribe(
        self,
        client_id: String,
        generation: u64,
        transport: Arc<dyn SessionTransport>,
    ) {
        let record = match self.inner.store.get_subscriptions(&client_id).await {
            Ok(record) => record,
            Err(err) => {
                tracing::error!(client_id = %client_id, error = %err, "failed to load subscriptions for resubscribe");
                metrics::counter!("gateway_resubscribe_failures_total").increment(1);
                return;
            }
        };
        let topics = record.map(|record| record.subscriptions).unwrap_or_default();
        for topic in topics {
            match transport.subscribe(&topic).await {
                Ok(()) => {
                    if !self.add_live(&client_id, generation, &topic).await {
                        return;
                    }
                    tracing::info!(client_id = %client_id, topic = %topic, "resubscribed to topic");
                }
                Err(err) => {
                    metrics::counter!("gateway_resubscribe_failures_total").increment(1);
                    tracing::error!(client_id = %client_id, topic = %topic, error = %err, "failed to resubscribe to topic");
                }
            }
        }
    }

    async fn pump_events(self, client_id: String, generation: u64, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connected => {
                    tracing::info!(client_id = %client_id, "reconnected to MQTT broker");
                    self.set_state(&client_id, generation, ConnectionState::Connected)
                        .await;
                }
                TransportEvent::Reconnecting => {
                    tracing::info!(client_id = %client_id, "reconnecting to MQTT broker");
                    self.set_state(&client_id, generation, ConnectionState::Reconnecting)
                        .await;
                }
                TransportEvent::Closed => {
                    tracing::info!(client_id = %client_id, "MQTT connection closed");
                    self.set_state(&client_id, generation, ConnectionState::Closed)
                        .await;
                    break;
                }
                TransportEvent::Message { topic, payload } => {
                    self.route_inbound_message(&client_id, &topic, payload).await;
                }
            }
        }
    }

    async fn set_state(&self, client_id: &str, generation: u64, state: ConnectionState) {
        let mut sessions = self.inner.sessions.write().await;
        if let Some(entry) = sessions.get_mut(client_id) {
            if entry.generation == generation && entry.state != state {
                entry.state = state;
                record_transition(state);
            }
        }
    }

    async fn add_live(&self, client_id: &str, generation: u64, topic: &str) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        match sessions.get_mut(client_id) {
            Some(entry) if entry.generation == generation => {
                entry.subscriptions.insert(topic.to_string());
                true
            }
            _ => false,
        }
    }

    /// Look up the transport for a gated operation on `client_id`.
    async fn gate(
        &self,
        client_id: &str,
        check: impl FnOnce(&SessionEntry) -> RegistryResult<()>,
    ) -> RegistryResult<(u64, Arc<dyn SessionTransport>)> {
        let sessions = self.inner.sessions.read().await;
        let entry = sessions
            .get(client_id)
            .ok_or_else(|| RegistryError::SessionNotFound(client_id.to_string()))?;
        check(entry)?;
        let transport = entry
            .transport
            .clone()
            .ok_or(RegistryError::Transport(TransportError::NotReady))?;
        Ok((entry.generation, transport))
    }

    /// Subscribe `client_id` to `topic`.
    ///
    /// # Errors
    /// - `SessionNotFound` / `AlreadySubscribed` before any side effect.
    /// - `Transport` if the broker did not acknowledge; nothing is mutated.
    /// - `Store` if the durable add failed after memory was updated.
    pub async fn subscribe(&self, client_id: &str, topic: &str) -> RegistryResult<()> {
        required(client_id, "client id")?;
        required(topic, "topic")?;
        let (generation, transport) = self
            .gate(client_id, |entry| {
                if entry.subscriptions.contains(topic) {
                    return Err(RegistryError::AlreadySubscribed {
                        client_id: client_id.to_string(),
                        topic: topic.to_string(),
                    });
                }
                Ok(())
            })
            .await?;

        if let Err(err) = transport.subscribe(topic).await {
            metrics::counter!("gateway_subscribe_total", "result" => "transport_error")
                .increment(1);
            tracing::error!(client_id = %client_id, topic = %topic, error = %err, "subscription failed");
            return Err(err.into());
        }
        if !self.add_live(client_id, generation, topic).await {
            return Err(RegistryError::SessionNotFound(client_id.to_string()));
        }
        if let Err(err) = self.inner.store.add_subscription(client_id, topic).await {
            metrics::counter!("gateway_subscribe_total", "result" => "store_error").increment(1);
            tracing::error!(client_id = %client_id, topic = %topic, error = %err, "failed to persist subscription");
            return Err(err.into());
        }
        metrics::counter!("gateway_subscribe_total", "result" => "ok").increment(1);
        tracing::info!(client_id = %client_id, topic = %topic, "subscribed to topic");
        Ok(())
    }

    /// Unsubscribe `client_id` from `topic`. Mirrors [`Self::subscribe`].
    pub async fn unsubscribe(&self, client_id: &str, topic: &str) -> RegistryResult<()> {
        required(client_id, "client id")?;
        required(topic, "topic")?;
        let (generation, transport) = self
            .gate(client_id, |entry| {
                if !entry.subscriptions.contains(topic) {
                    return Err(RegistryError::NotSubscribed {
                        client_id: client_id.to_string(),
                        topic: topic.to_string(),
                    });
                }
                Ok(())
            })
            .await?;

        if let Err(err) = transport.unsubscribe(topic).await {
            metrics::counter!("gateway_unsubscribe_total", "result" => "transport_error")
                .increment(1);
            tracing::error!(client_id = %client_id, topic = %topic, error = %err, "unsubscription failed");
            return Err(err.into());
        }
        let removed = {
            let mut sessions = self.inner.sessions.write().await;
            match sessions.get_mut(client_id) {
                Some(entry) if entry.generation == generation => {
                    entry.subscriptions.remove(topic);
                    true
                }
                _ => false,
            }
        };
        if !removed {
            return Err(RegistryError::SessionNotFound(client_id.to_string()));
        }
        if let Err(err) = self.inner.store.remove_subscription(client_id, topic).await {
            metrics::counter!("gateway_unsubscribe_total", "result" => "store_error")
                .increment(1);
            tracing::error!(client_id = %client_id, topic = %topic, error = %err, "failed to remove persisted subscription");
            return Err(err.into());
        }
        metrics::counter!("gateway_unsubscribe_total", "result" => "ok").increment(1);
        tracing::info!(client_id = %client_id, topic = %topic, "unsubscribed from topic");
        Ok(())
    }

    /// Persist one inbound publish. Failures are logged and the message is dropped.
    pub async fn route_inbound_message(&self, client_id: &str, topic: &str, payload: Vec<u8>) {
        tracing::debug!(client_id = %client_id, topic = %topic, bytes = payload.len(), "received message");
        let message = NewMessage {
            client_id: client_id.to_string(),
            topic: topic.to_string(),
            payload,
            received_at: Utc::now(),
        };
        match self.inner.store.append_message(message).await {
            Ok(_) => {
                metrics::counter!("gateway_messages_routed_total", "result" => "ok").increment(1);
            }
            Err(err) => {
                metrics::counter!("gateway_messages_routed_total", "result" => "store_error")
                    .increment(1);
                tracing::error!(client_id = %client_id, topic = %topic, error = %err, "error saving message");
            }
        }
    }

    /// Read the durable subscription set for `client_id`.
    ///
    /// # Errors
    /// - `NotFound` when no durable record exists, even if a live session does.
    pub async fn get_subscriptions(&self, client_id: &str) -> RegistryResult<Vec<String>> {
        required(client_id, "client id")?;
        match self.inner.store.get_subscriptions(client_id).await? {
            Some(record) => Ok(record.subscriptions),
            None => Err(RegistryError::NotFound(client_id.to_string())),
        }
    }

    /// Disconnect and forget `client_id`. The durable record is kept.
    pub async fn close_session(&self, client_id: &str) -> RegistryResult<()> {
        required(client_id, "client id")?;
        let entry = {
            let mut sessions = self.inner.sessions.write().await;
            let entry = sessions
                .remove(client_id)
                .ok_or_else(|| RegistryError::SessionNotFound(client_id.to_string()))?;
            metrics::gauge!("gateway_sessions_active").set(sessions.len() as f64);
            entry
        };
        if entry.state != ConnectionState::Closed {
            record_transition(ConnectionState::Closed);
        }
        if let Some(transport) = entry.transport {
            transport.close().await;
        }
        tracing::info!(client_id = %client_id, "MQTT session closed");
        Ok(())
    }

    /// Close every session. Used on shutdown.
    pub async fn close_all(&self) {
        let ids = self.client_ids().await;
        for client_id in ids {
            if let Err(err) = self.close_session(&client_id).await {
                tracing::warn!(client_id = %client_id, error = %err, "failed to close session");
            }
        }
    }

    pub async fn contains(&self, client_id: &str) -> bool {
        self.inner.sessions.read().await.contains_key(client_id)
    }

    pub async fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            connected_clients: self.client_ids().await,
            timestamp: Utc::now(),
        }
    }

    pub async fn session_info(&self, client_id: &str) -> Option<SessionInfo> {
        let sessions = self.inner.sessions.read().await;
        sessions.get(client_id).map(|entry| SessionInfo {
            client_id: client_id.to_string(),
            broker_url: entry.broker_url.clone(),
            state: entry.state,
            subscriptions: entry.subscriptions.iter().cloned().collect(),
        })
    }
}
