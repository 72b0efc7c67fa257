//! `rumqttc`-backed transport.
//!
//! # Purpose
//! Opens one `rumqttc::AsyncClient` per session and drives its event loop on a
//! dedicated task. The task forwards inbound publishes and connection changes
//! as [`TransportEvent`]s and resolves subscribe/unsubscribe waiters when the
//! matching SUBACK/UNSUBACK arrives.
//!
//! # Acknowledgement tracking
//! `rumqttc` assigns packet ids inside the event loop, so requests are matched
//! in two steps. A waiter is queued in request order before the request enters
//! the client channel; when the event loop reports `Outgoing::Subscribe(pkid)`
//! (or `Unsubscribe`) the oldest queued waiter is bound to that packet id. The
//! request lock keeps queue order and channel order identical.
//!
//! # Reconnects
//! After the first CONNACK, connection errors emit `Reconnecting` and the loop
//! keeps polling with capped exponential backoff. In-flight waiters fail when
//! the connection drops; queued requests are sent after the reconnect.
use super::{
    ConnectRequest, EventSender, SessionTransport, TransportConnector, TransportError,
    TransportEvent,
};
use async_trait::async_trait;
use rand::Rng;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};

const DEFAULT_KEEPALIVE_SECS: u64 = 60;
const MIN_KEEPALIVE_SECS: u64 = 5;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RECONNECT_PERIOD_MS: u64 = 1_000;

/// Parsed broker URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerEndpoint {
    /// Parse `scheme://host[:port][/]`.
    ///
    /// Plain schemes: `mqtt`, `tcp` (default port 1883). TLS schemes: `mqtts`,
    /// `ssl`, `tls` (default port 8883). IPv6 hosts must be bracketed.
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let invalid = |reason: &str| TransportError::InvalidEndpoint(format!("{url}: {reason}"));
        let (scheme, rest) = url
            .trim()
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        let tls = match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" | "tls" => true,
            _ => return Err(invalid("unsupported scheme")),
        };
        let authority = rest.trim_end_matches('/');
        if authority.contains('/') || authority.contains('@') {
            return Err(invalid("unexpected path or userinfo"));
        }
        let default_port = if tls { 8883 } else { 1883 };
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 host"))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid("invalid port"))?,
                None if tail.is_empty() => default_port,
                None => return Err(invalid("invalid port")),
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (
                    host.to_string(),
                    port.parse().map_err(|_| invalid("invalid port"))?,
                ),
                None => (authority.to_string(), default_port),
            }
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        Ok(Self { host, port, tls })
    }
}

/// Client options accepted in the opaque `options` object.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientOptions {
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive: Option<u64>,
    pub clean: Option<bool>,
    pub client_id: Option<String>,
    pub qos: Option<u8>,
    pub connect_timeout: Option<u64>,
    pub reconnect_period: Option<u64>,
}

impl ClientOptions {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, TransportError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|err| TransportError::InvalidOptions(err.to_string()))
    }

    pub fn qos(&self) -> Result<QoS, TransportError> {
        match self.qos.unwrap_or(0) {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(TransportError::InvalidOptions(format!(
                "qos must be 0, 1 or 2, got {other}"
            ))),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS))
    }

    pub fn reconnect_period(&self) -> Duration {
        Duration::from_millis(self.reconnect_period.unwrap_or(DEFAULT_RECONNECT_PERIOD_MS))
    }
}

/// Build `rumqttc` options for a session.
pub fn build_mqtt_options(
    request: &ConnectRequest,
    options: &ClientOptions,
) -> Result<MqttOptions, TransportError> {
    let endpoint = BrokerEndpoint::parse(&request.broker_url)?;
    let client_id = options
        .client_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| request.client_id.clone());
    let mut mqtt_options = MqttOptions::new(client_id, endpoint.host, endpoint.port);
    let keepalive = options
        .keepalive
        .unwrap_or(DEFAULT_KEEPALIVE_SECS)
        .max(MIN_KEEPALIVE_SECS);
    mqtt_options.set_keep_alive(Duration::from_secs(keepalive));
    mqtt_options.set_clean_session(options.clean.unwrap_or(true));
    if let Some(username) = &options.username {
        mqtt_options.set_credentials(
            username.clone(),
            options.password.clone().unwrap_or_default(),
        );
    }
    if endpoint.tls {
        mqtt_options.set_transport(Transport::Tls(TlsConfiguration::default()));
    }
    Ok(mqtt_options)
}

/// Capped exponential backoff with jitter for reconnect attempts.
#[derive(Debug)]
struct Backoff {
    base_ms: u64,
    current_ms: u64,
    max_ms: u64,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        let base_ms = (base.as_millis() as u64).max(1);
        Self {
            base_ms,
            current_ms: base_ms,
            max_ms: (max.as_millis() as u64).max(base_ms),
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current_ms;
        self.current_ms = (self.current_ms.saturating_mul(2)).min(self.max_ms);
        let jitter = delay / 4;
        let actual = if jitter == 0 {
            delay
        } else {
            delay - jitter + rand::thread_rng().gen_range(0..=jitter * 2)
        };
        Duration::from_millis(actual)
    }

    fn reset(&mut self) {
        self.current_ms = self.base_ms;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Subscribe,
    Unsubscribe,
}

struct Waiter {
    kind: RequestKind,
    topic: String,
    reply: oneshot::Sender<Result<(), TransportError>>,
}

#[derive(Default)]
struct PendingAcks {
    queued: VecDeque<Waiter>,
    in_flight: HashMap<u16, Waiter>,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<PendingAcks>,
    closing: AtomicBool,
    shutdown: Notify,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingAcks> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bind(&self, kind: RequestKind, pkid: u16) {
        let mut pending = self.pending();
        match pending.queued.pop_front() {
            Some(waiter) if waiter.kind == kind => {
                pending.in_flight.insert(pkid, waiter);
            }
            Some(waiter) => {
                tracing::warn!(topic = %waiter.topic, pkid, "outgoing request order mismatch");
                let _ = waiter
                    .reply
                    .send(Err(TransportError::Request("request order mismatch".into())));
            }
            None => {}
        }
    }

    fn complete(&self, pkid: u16, result: Result<(), TransportError>) {
        if let Some(waiter) = self.pending().in_flight.remove(&pkid) {
            let _ = waiter.reply.send(result);
        }
    }

    fn fail_in_flight(&self, reason: &str) {
        let drained: Vec<_> = self.pending().in_flight.drain().map(|(_, w)| w).collect();
        for waiter in drained {
            let _ = waiter
                .reply
                .send(Err(TransportError::Request(reason.to_string())));
        }
    }

    fn fail_all(&self) {
        let mut guard = self.pending();
        let pending = &mut *guard;
        let waiters: Vec<_> = pending
            .queued
            .drain(..)
            .chain(pending.in_flight.drain().map(|(_, w)| w))
            .collect();
        drop(guard);
        for waiter in waiters {
            let _ = waiter.reply.send(Err(TransportError::Closed));
        }
    }
}

/// Connector producing `rumqttc` sessions.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    channel_capacity: usize,
    reconnect_backoff_max: Duration,
}

impl MqttConnector {
    pub fn new(channel_capacity: usize, reconnect_backoff_max: Duration) -> Self {
        Self {
            channel_capacity: channel_capacity.max(1),
            reconnect_backoff_max,
        }
    }
}

#[async_trait]
impl TransportConnector for MqttConnector {
    async fn connect(
        &self,
        request: ConnectRequest,
        events: EventSender,
    ) -> Result<Arc<dyn SessionTransport>, TransportError> {
        let options = ClientOptions::from_value(&request.options)?;
        let qos = options.qos()?;
        let mqtt_options = build_mqtt_options(&request, &options)?;
        let (client, eventloop) = AsyncClient::new(mqtt_options, self.channel_capacity);
        let shared = Arc::new(Shared::default());
        let (ready_tx, ready_rx) = oneshot::channel();
        let backoff = Backoff::new(options.reconnect_period(), self.reconnect_backoff_max);
        tokio::spawn(drive_event_loop(
            request.client_id.clone(),
            eventloop,
            shared.clone(),
            events,
            ready_tx,
            backoff,
        ));

        match tokio::time::timeout(options.connect_timeout(), ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(Arc::new(MqttSession {
                client,
                qos,
                shared,
                request_lock: tokio::sync::Mutex::new(()),
            })),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                shared.closing.store(true, Ordering::SeqCst);
                shared.shutdown.notify_one();
                Err(TransportError::Connect(format!(
                    "no CONNACK from {} within {:?}",
                    request.broker_url,
                    options.connect_timeout()
                )))
            }
        }
    }
}

async fn drive_event_loop(
    client_id: String,
    mut eventloop: EventLoop,
    shared: Arc<Shared>,
    events: EventSender,
    ready: oneshot::Sender<Result<(), TransportError>>,
    mut backoff: Backoff,
) {
    let mut ready = Some(ready);
    let mut connected = false;
    let mut established = false;
    loop {
        let polled = tokio::select! {
            _ = shared.shutdown.notified() => break,
            polled = eventloop.poll() => polled,
        };
        match polled {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    let err =
                        TransportError::Connect(format!("connection refused: {:?}", ack.code));
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(err));
                        break;
                    }
                    tracing::warn!(client_id = %client_id, code = ?ack.code, "broker refused reconnect");
                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                }
                backoff.reset();
                connected = true;
                established = true;
                match ready.take() {
                    Some(ready) => {
                        let _ = ready.send(Ok(()));
                    }
                    None => {
                        events.send(TransportEvent::Connected);
                    }
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                events.send(TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                let result = if rejected {
                    Err(TransportError::SubscribeRejected(format!("pkid {}", ack.pkid)))
                } else {
                    Ok(())
                };
                shared.complete(ack.pkid, result);
            }
            Ok(Event::Incoming(Incoming::UnsubAck(ack))) => {
                shared.complete(ack.pkid, Ok(()));
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                shared.bind(RequestKind::Subscribe, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                shared.bind(RequestKind::Unsubscribe, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                if shared.closing.load(Ordering::SeqCst) {
                    break;
                }
            }
            Ok(_) => {}
            Err(err) => {
                if shared.closing.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(TransportError::Connect(err.to_string())));
                    break;
                }
                shared.fail_in_flight("connection lost");
                if connected {
                    connected = false;
                    tracing::warn!(client_id = %client_id, error = %err, "mqtt connection lost");
                    events.send(TransportEvent::Reconnecting);
                }
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = shared.shutdown.notified() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    shared.fail_all();
    if established {
        events.send(TransportEvent::Closed);
    }
}

struct MqttSession {
    client: AsyncClient,
    qos: QoS,
    shared: Arc<Shared>,
    request_lock: tokio::sync::Mutex<()>,
}

impl MqttSession {
    async fn request(&self, kind: RequestKind, topic: &str) -> Result<(), TransportError> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let (reply, wait) = oneshot::channel();
        {
            let _order = self.request_lock.lock().await;
            self.shared.pending().queued.push_back(Waiter {
                kind,
                topic: topic.to_string(),
                reply,
            });
            let sent = match kind {
                RequestKind::Subscribe => self.client.subscribe(topic, self.qos).await,
                RequestKind::Unsubscribe => self.client.unsubscribe(topic).await,
            };
            if let Err(err) = sent {
                self.shared.pending().queued.pop_back();
                return Err(TransportError::Request(err.to_string()));
            }
        }
        let result = wait.await.map_err(|_| TransportError::Closed)?;
        result.map_err(|err| match err {
            TransportError::SubscribeRejected(_) => {
                TransportError::SubscribeRejected(topic.to_string())
            }
            other => other,
        })
    }
}

#[async_trait]
impl SessionTransport for MqttSession {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.request(RequestKind::Subscribe, topic).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.request(RequestKind::Unsubscribe, topic).await
    }

    async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.client.disconnect().await.is_err() {
            self.shared.shutdown.notify_one();
        }
    }
}
