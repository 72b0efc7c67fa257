//! Reachability gate for the external key-value cache.
//!
//! # Purpose
//! The control plane refuses to serve requests while the cache is unreachable.
//! [`LivenessProbe::check_reachable`] performs one round-trip and never retries;
//! [`spawn_liveness_monitor`] polls independently in the background and only
//! logs transitions.
//!
//! # Wire format
//! [`RedisPingProbe`] speaks the minimal RESP exchange needed for a ping:
//! it sends `*1\r\n$4\r\nPING\r\n` and expects a `+PONG` simple-string reply.
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const PING_COMMAND: &[u8] = b"*1\r\n$4\r\nPING\r\n";

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn check_reachable(&self) -> bool;
}

/// Ping a Redis-compatible cache over TCP.
#[derive(Debug, Clone)]
pub struct RedisPingProbe {
    address: String,
    timeout: Duration,
}

impl RedisPingProbe {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    async fn ping(&self) -> std::io::Result<String> {
        let mut stream = TcpStream::connect(&self.address).await?;
        stream.write_all(PING_COMMAND).await?;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        Ok(line)
    }
}

#[async_trait]
impl LivenessProbe for RedisPingProbe {
    async fn check_reachable(&self) -> bool {
        match tokio::time::timeout(self.timeout, self.ping()).await {
            Ok(Ok(reply)) if reply.trim_end() == "+PONG" => true,
            Ok(Ok(reply)) => {
                tracing::warn!(reply = %reply.trim_end(), "unexpected cache ping reply");
                false
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, address = %self.address, "cache ping failed");
                false
            }
            Err(_) => {
                tracing::warn!(address = %self.address, "cache ping timed out");
                false
            }
        }
    }
}

/// Probe that always succeeds. Used when the gate is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReachable;

#[async_trait]
impl LivenessProbe for AlwaysReachable {
    async fn check_reachable(&self) -> bool {
        true
    }
}

/// Poll `probe` every `interval`, logging reachability transitions and
/// exporting the `gateway_cache_reachable` gauge.
pub fn spawn_liveness_monitor(
    probe: Arc<dyn LivenessProbe>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut last: Option<bool> = None;
        loop {
            ticker.tick().await;
            let reachable = probe.check_reachable().await;
            metrics::gauge!("gateway_cache_reachable").set(if reachable { 1.0 } else { 0.0 });
            if last != Some(reachable) {
                if reachable {
                    tracing::info!("cache is reachable");
                } else {
                    tracing::error!("cache is not reachable");
                }
                last = Some(reachable);
            }
        }
    })
}
