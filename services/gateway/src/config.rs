//! Gateway configuration.
//!
//! # Purpose
//! Loads listener addresses, storage backend selection, liveness cache address,
//! cluster settings, and MQTT transport tuning from the environment, with an
//! optional YAML override file named by `MQTT_GATEWAY_CONFIG`.
use crate::store::DEFAULT_MEMORY_LOG_CAPACITY;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_BIND: &str = "0.0.0.0:22000";
pub const DEFAULT_METRICS_BIND: &str = "0.0.0.0:9464";
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_MQTT_CHANNEL_CAPACITY: usize = 64;
pub const DEFAULT_RECONNECT_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_LIVENESS_TIMEOUT_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

impl StorageBackend {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            other => bail!("unknown storage backend: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
    pub disabled: bool,
}

impl LivenessConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub enabled: bool,
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub channel_capacity: usize,
    pub reconnect_backoff_max_ms: u64,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub metrics_bind: SocketAddr,
    pub storage: StorageBackend,
    pub postgres: Option<PostgresConfig>,
    /// Messages kept per `(client, topic)` log by the memory backend.
    pub memory_log_capacity: usize,
    pub liveness: LivenessConfig,
    pub cluster: ClusterConfig,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayConfigOverride {
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    storage_backend: Option<String>,
    database_url: Option<String>,
    memory_log_capacity: Option<usize>,
    redis_host: Option<String>,
    redis_port: Option<u16>,
    cluster_mode: Option<bool>,
    workers: Option<usize>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value.trim().parse().with_context(|| format!("parse {key}")),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str) -> Result<bool> {
    match std::env::var(key) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => bail!("parse {key}: expected a boolean, got {other}"),
        },
        Err(_) => Ok(false),
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let mut bind_addr: SocketAddr = env_or("MQTT_GATEWAY_BIND", DEFAULT_BIND)
            .parse()
            .with_context(|| "parse MQTT_GATEWAY_BIND")?;
        if std::env::var("MQTT_GATEWAY_BIND").is_err() {
            if let Ok(port) = std::env::var("PORT") {
                bind_addr.set_port(port.trim().parse().with_context(|| "parse PORT")?);
            }
        }
        let metrics_bind = env_or("MQTT_GATEWAY_METRICS_BIND", DEFAULT_METRICS_BIND)
            .parse()
            .with_context(|| "parse MQTT_GATEWAY_METRICS_BIND")?;
        let storage = StorageBackend::parse(&env_or("MQTT_GATEWAY_STORAGE_BACKEND", "memory"))?;
        let postgres = match std::env::var("MQTT_GATEWAY_DATABASE_URL") {
            Ok(url) => Some(PostgresConfig {
                url,
                max_connections: env_parse("MQTT_GATEWAY_DB_MAX_CONNECTIONS", 10)?,
                connect_timeout_ms: env_parse("MQTT_GATEWAY_DB_CONNECT_TIMEOUT_MS", 5_000)?,
                acquire_timeout_ms: env_parse("MQTT_GATEWAY_DB_ACQUIRE_TIMEOUT_MS", 5_000)?,
            }),
            Err(_) => None,
        };
        let memory_log_capacity = env_parse(
            "MQTT_GATEWAY_MEMORY_LOG_CAPACITY",
            DEFAULT_MEMORY_LOG_CAPACITY,
        )?;
        let liveness = LivenessConfig {
            host: env_or("REDIS_HOST", "localhost"),
            port: env_parse("REDIS_PORT", 6379)?,
            timeout_ms: env_parse("MQTT_GATEWAY_LIVENESS_TIMEOUT_MS", DEFAULT_LIVENESS_TIMEOUT_MS)?,
            disabled: env_flag("MQTT_GATEWAY_LIVENESS_DISABLED")?,
        };
        let cluster = ClusterConfig {
            enabled: env_flag("CLUSTER_MODE")?,
            workers: env_parse("MQTT_GATEWAY_WORKERS", DEFAULT_WORKERS)?,
        };
        let mqtt = MqttConfig {
            channel_capacity: env_parse(
                "MQTT_GATEWAY_MQTT_CHANNEL_CAPACITY",
                DEFAULT_MQTT_CHANNEL_CAPACITY,
            )?,
            reconnect_backoff_max_ms: env_parse(
                "MQTT_GATEWAY_RECONNECT_BACKOFF_MAX_MS",
                DEFAULT_RECONNECT_BACKOFF_MAX_MS,
            )?,
        };
        let config = Self {
            bind_addr,
            metrics_bind,
            storage,
            postgres,
            memory_log_capacity,
            liveness,
            cluster,
            mqtt,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("MQTT_GATEWAY_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read MQTT_GATEWAY_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: GatewayConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse gateway config yaml")?;
        if let Some(value) = override_cfg.bind_addr {
            self.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.storage_backend {
            self.storage = StorageBackend::parse(&value)?;
        }
        if let Some(url) = override_cfg.database_url {
            match self.postgres.as_mut() {
                Some(pg) => pg.url = url,
                None => {
                    self.postgres = Some(PostgresConfig {
                        url,
                        max_connections: 10,
                        connect_timeout_ms: 5_000,
                        acquire_timeout_ms: 5_000,
                    })
                }
            }
        }
        if let Some(value) = override_cfg.memory_log_capacity {
            self.memory_log_capacity = value;
        }
        if let Some(value) = override_cfg.redis_host {
            self.liveness.host = value;
        }
        if let Some(value) = override_cfg.redis_port {
            self.liveness.port = value;
        }
        if let Some(value) = override_cfg.cluster_mode {
            self.cluster.enabled = value;
        }
        if let Some(value) = override_cfg.workers {
            self.cluster.workers = value;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.cluster.enabled && self.cluster.workers == 0 {
            bail!("cluster mode requires at least one worker");
        }
        if self.memory_log_capacity == 0 {
            bail!("MQTT_GATEWAY_MEMORY_LOG_CAPACITY must be positive");
        }
        if self.mqtt.channel_capacity == 0 {
            bail!("MQTT_GATEWAY_MQTT_CHANNEL_CAPACITY must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "MQTT_GATEWAY_BIND",
        "MQTT_GATEWAY_METRICS_BIND",
        "MQTT_GATEWAY_STORAGE_BACKEND",
        "MQTT_GATEWAY_DATABASE_URL",
        "MQTT_GATEWAY_CONFIG",
        "MQTT_GATEWAY_WORKERS",
        "MQTT_GATEWAY_LIVENESS_DISABLED",
        "MQTT_GATEWAY_MEMORY_LOG_CAPACITY",
        "CLUSTER_MODE",
        "PORT",
        "REDIS_HOST",
        "REDIS_PORT",
    ];

    struct EnvGuard {
        saved: Vec<(&'static str, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let saved = KEYS
                .iter()
                .map(|key| (*key, std::env::var(key).ok()))
                .collect();
            for key in KEYS {
                unsafe {
                    std::env::remove_var(key);
                }
            }
            Self { saved }
        }

        fn set(&self, key: &str, value: &str) {
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in &self.saved {
                match value {
                    Some(value) => unsafe { std::env::set_var(key, value) },
                    None => unsafe { std::env::remove_var(key) },
                }
            }
        }
    }

    #[test]
    #[serial]
    fn defaults_without_env() {
        let _guard = EnvGuard::clean();
        let config = GatewayConfig::from_env().expect("config");
        assert_eq!(config.bind_addr, DEFAULT_BIND.parse::<SocketAddr>().unwrap());
        assert_eq!(config.storage, StorageBackend::Memory);
        assert!(config.postgres.is_none());
        assert_eq!(config.liveness.address(), "localhost:6379");
        assert!(!config.liveness.disabled);
        assert!(!config.cluster.enabled);
        assert_eq!(config.cluster.workers, DEFAULT_WORKERS);
        assert_eq!(config.memory_log_capacity, DEFAULT_MEMORY_LOG_CAPACITY);
    }

    #[test]
    #[serial]
    fn port_overrides_default_bind_port() {
        let guard = EnvGuard::clean();
        guard.set("PORT", "23000");
        let config = GatewayConfig::from_env().expect("config");
        assert_eq!(config.bind_addr.port(), 23000);
    }

    #[test]
    #[serial]
    fn explicit_values_are_parsed() {
        let guard = EnvGuard::clean();
        guard.set("MQTT_GATEWAY_STORAGE_BACKEND", "postgres");
        guard.set("MQTT_GATEWAY_DATABASE_URL", "postgres://localhost/gateway");
        guard.set("REDIS_HOST", "cache");
        guard.set("REDIS_PORT", "6380");
        guard.set("CLUSTER_MODE", "true");
        guard.set("MQTT_GATEWAY_WORKERS", "2");
        let config = GatewayConfig::from_env().expect("config");
        assert_eq!(config.storage, StorageBackend::Postgres);
        assert_eq!(
            config.postgres.expect("postgres").url,
            "postgres://localhost/gateway"
        );
        assert_eq!(config.liveness.address(), "cache:6380");
        assert!(config.cluster.enabled);
        assert_eq!(config.cluster.workers, 2);
    }

    #[test]
    #[serial]
    fn invalid_values_fail_with_context() {
        let guard = EnvGuard::clean();
        guard.set("REDIS_PORT", "not-a-port");
        let err = GatewayConfig::from_env().expect_err("invalid port");
        assert!(err.to_string().contains("REDIS_PORT"));

        guard.set("REDIS_PORT", "6379");
        guard.set("MQTT_GATEWAY_STORAGE_BACKEND", "mongo");
        let err = GatewayConfig::from_env().expect_err("invalid backend");
        assert!(err.to_string().contains("unknown storage backend"));
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() {
        let _guard = EnvGuard::clean();
        let mut config = GatewayConfig::from_env().expect("config");
        config
            .apply_yaml(
                "bind_addr: 127.0.0.1:9000\nstorage_backend: postgres\ndatabase_url: postgres://db/x\nredis_port: 7000\ncluster_mode: true\nworkers: 3\n",
            )
            .expect("yaml");
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.storage, StorageBackend::Postgres);
        assert_eq!(config.postgres.expect("pg").url, "postgres://db/x");
        assert_eq!(config.liveness.port, 7000);
        assert!(config.cluster.enabled);
        assert_eq!(config.cluster.workers, 3);
    }

    #[test]
    #[serial]
    fn memory_log_capacity_must_be_positive() {
        let guard = EnvGuard::clean();
        guard.set("MQTT_GATEWAY_MEMORY_LOG_CAPACITY", "500");
        let mut config = GatewayConfig::from_env().expect("config");
        assert_eq!(config.memory_log_capacity, 500);
        assert!(config.apply_yaml("memory_log_capacity: 0\n").is_err());

        guard.set("MQTT_GATEWAY_MEMORY_LOG_CAPACITY", "0");
        assert!(GatewayConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn cluster_with_zero_workers_is_rejected() {
        let guard = EnvGuard::clean();
        guard.set("CLUSTER_MODE", "true");
        guard.set("MQTT_GATEWAY_WORKERS", "0");
        assert!(GatewayConfig::from_env().is_err());
    }
}
