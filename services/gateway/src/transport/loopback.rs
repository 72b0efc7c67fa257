//! In-process transport that stands in for an MQTT broker.
//!
//! # Purpose
//! Lets the registry and HTTP API run end to end without a network broker:
//! sessions "connect" to an in-memory peer table, subscriptions are tracked per
//! peer, and [`LoopbackConnector::publish`] delivers to every peer whose filter
//! matches. Failure knobs allow exercising refused connects, rejected
//! subscriptions, reconnects, and broker-side closes.
//!
//! # Notes
//! A second connect with the same client id takes over the old peer, which is
//! sent [`TransportEvent::Closed`], mirroring MQTT session takeover.
use super::mqtt::BrokerEndpoint;
use super::{
    ConnectRequest, EventSender, SessionTransport, TransportConnector, TransportError,
    TransportEvent, topic_matches,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Clone, Default)]
pub struct LoopbackConnector {
    state: Arc<LoopbackState>,
}

#[derive(Default)]
struct LoopbackState {
    peers: Mutex<HashMap<String, Peer>>,
    refused_brokers: Mutex<HashSet<String>>,
    rejected_topics: Mutex<HashSet<String>>,
    connect_delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
    subscribes: AtomicUsize,
    next_peer_id: AtomicU64,
}

struct Peer {
    id: u64,
    events: EventSender,
    filters: Vec<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every connect to `broker_url` fail.
    pub fn refuse_broker(&self, broker_url: &str) {
        lock(&self.state.refused_brokers).insert(broker_url.to_string());
    }

    /// Make every subscribe to `topic` fail with a broker rejection.
    pub fn reject_topic(&self, topic: &str) {
        lock(&self.state.rejected_topics).insert(topic.to_string());
    }

    /// Delay every connect, keeping the session in `Connecting` meanwhile.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *lock(&self.state.connect_delay) = delay;
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Subscribe requests received across all sessions, rejected ones included.
    pub fn subscribe_count(&self) -> usize {
        self.state.subscribes.load(Ordering::SeqCst)
    }

    /// Filters currently held by the broker for `client_id`.
    pub fn broker_filters(&self, client_id: &str) -> Vec<String> {
        lock(&self.state.peers)
            .get(client_id)
            .map(|peer| peer.filters.clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        lock(&self.state.peers).contains_key(client_id)
    }

    /// Deliver a publish to `client_id` if one of its filters matches `topic`.
    pub fn publish(&self, client_id: &str, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let peers = lock(&self.state.peers);
        let Some(peer) = peers.get(client_id) else {
            return false;
        };
        if !peer.filters.iter().any(|filter| topic_matches(filter, topic)) {
            return false;
        }
        peer.events.send(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        })
    }

    /// Emit a connection loss followed by a successful reconnect.
    pub fn bounce(&self, client_id: &str) -> bool {
        let peers = lock(&self.state.peers);
        let Some(peer) = peers.get(client_id) else {
            return false;
        };
        peer.events.send(TransportEvent::Reconnecting)
            && peer.events.send(TransportEvent::Connected)
    }

    /// Emit a connection loss without recovering.
    pub fn drop_link(&self, client_id: &str) -> bool {
        lock(&self.state.peers)
            .get(client_id)
            .map(|peer| peer.events.send(TransportEvent::Reconnecting))
            .unwrap_or(false)
    }

    /// Close the connection from the broker side.
    pub fn kick(&self, client_id: &str) -> bool {
        match lock(&self.state.peers).remove(client_id) {
            Some(peer) => peer.events.send(TransportEvent::Closed),
            None => false,
        }
    }
}

#[async_trait]
impl TransportConnector for LoopbackConnector {
    async fn connect(
        &self,
        request: ConnectRequest,
        events: EventSender,
    ) -> Result<Arc<dyn SessionTransport>, TransportError> {
        BrokerEndpoint::parse(&request.broker_url)?;
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.state.connect_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.state.refused_brokers).contains(&request.broker_url) {
            return Err(TransportError::Connect(format!(
                "connection refused by {}",
                request.broker_url
            )));
        }
        let id = self.state.next_peer_id.fetch_add(1, Ordering::SeqCst);
        let previous = lock(&self.state.peers).insert(
            request.client_id.clone(),
            Peer {
                id,
                events,
                filters: Vec::new(),
            },
        );
        if let Some(previous) = previous {
            previous.events.send(TransportEvent::Closed);
        }
        Ok(Arc::new(LoopbackSession {
            client_id: request.client_id,
            peer_id: id,
            state: self.state.clone(),
        }))
    }
}

struct LoopbackSession {
    client_id: String,
    peer_id: u64,
    state: Arc<LoopbackState>,
}

impl LoopbackSession {
    fn with_peer<R>(&self, f: impl FnOnce(&mut Peer) -> R) -> Result<R, TransportError> {
        let mut peers = lock(&self.state.peers);
        match peers.get_mut(&self.client_id) {
            Some(peer) if peer.id == self.peer_id => Ok(f(peer)),
            _ => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl SessionTransport for LoopbackSession {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.state.subscribes.fetch_add(1, Ordering::SeqCst);
        if lock(&self.state.rejected_topics).contains(topic) {
            return Err(TransportError::SubscribeRejected(topic.to_string()));
        }
        self.with_peer(|peer| {
            if !peer.filters.iter().any(|filter| filter == topic) {
                peer.filters.push(topic.to_string());
            }
        })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.with_peer(|peer| peer.filters.retain(|filter| filter != topic))
    }

    async fn close(&self) {
        let mut peers = lock(&self.state.peers);
        let owned = matches!(peers.get(&self.client_id), Some(peer) if peer.id == self.peer_id);
        if owned {
            if let Some(peer) = peers.remove(&self.client_id) {
                peer.events.send(TransportEvent::Closed);
            }
        }
    }
}
