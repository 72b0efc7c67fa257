//! MQTT session gateway HTTP service entry point.
//!
//! # Purpose
//! Wires configuration, storage, the MQTT transport, and the liveness gate into
//! the HTTP router, then serves until Ctrl-C. In cluster mode the process only
//! supervises worker copies of itself.
//!
//! # Notes
//! The `build_state` helper keeps wiring testable and minimizes main setup logic.
use anyhow::Context;
use gateway::app::{AppState, build_router};
use gateway::cluster::{self, Supervisor};
use gateway::config::{self, GatewayConfig};
use gateway::liveness::{self, AlwaysReachable, LivenessProbe, RedisPingProbe};
use gateway::observability;
use gateway::registry::SessionRegistry;
use gateway::store::{GatewayStore, StoreConfig, memory::InMemoryStore, postgres::PostgresStore};
use gateway::transport::mqtt::MqttConnector;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const LIVENESS_MONITOR_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env_or_yaml().context("gateway config")?;
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(config: GatewayConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("mqtt-gateway")?;

    if config.cluster.enabled && !cluster::is_worker() {
        let started = Supervisor::for_current_exe(config.cluster.workers)?
            .run(shutdown)
            .await?;
        tracing::info!(started, "cluster supervisor exited");
        return Ok(());
    }

    let state = build_state(config.clone()).await?;
    tracing::info!(
        backend = state.store.backend_name(),
        durable = state.store.is_durable(),
        "storage ready"
    );
    let metrics_addr = worker_metrics_bind(config.metrics_bind);
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("bind metrics {metrics_addr}"))?;
    let metrics_task = tokio::spawn(observability::serve_metrics(metrics_handle, metrics_listener));
    let monitor_task = (!config.liveness.disabled).then(|| {
        liveness::spawn_liveness_monitor(state.liveness.clone(), LIVENESS_MONITOR_INTERVAL)
    });

    let app = build_router(state.clone());
    let addr = config.bind_addr;
    let listener = cluster::bind_listener(addr, cluster::is_worker())
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, worker = ?cluster::worker_id(), "gateway listening");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;

    state.registry.close_all().await;
    metrics_task.abort();
    if let Some(task) = &monitor_task {
        task.abort();
    }
    let _ = metrics_task.await;
    if let Some(task) = monitor_task {
        let _ = task.await;
    }
    tracing::info!("gateway stopped");
    Ok(())
}

/// Workers expose metrics on consecutive ports after the configured one.
fn worker_metrics_bind(configured: SocketAddr) -> SocketAddr {
    let offset = cluster::worker_id()
        .and_then(|id| id.parse::<u16>().ok())
        .map(|id| id + 1);
    match offset {
        Some(offset) if configured.port() != 0 => {
            let mut addr = configured;
            addr.set_port(configured.port().saturating_add(offset));
            addr
        }
        _ => configured,
    }
}

async fn build_state(config: GatewayConfig) -> anyhow::Result<AppState> {
    let store_config = StoreConfig {
        memory_log_capacity: config.memory_log_capacity,
        ..StoreConfig::default()
    };
    let store: Arc<dyn GatewayStore> = match config.storage {
        config::StorageBackend::Memory => Arc::new(InMemoryStore::new(store_config.clone())),
        config::StorageBackend::Postgres => {
            let pg = config
                .postgres
                .as_ref()
                .context("postgres configuration missing")?;
            Arc::new(PostgresStore::connect(pg, store_config.clone()).await?)
        }
    };
    store
        .health_check()
        .await
        .with_context(|| format!("{} store health check", store.backend_name()))?;
    let connector = Arc::new(MqttConnector::new(
        config.mqtt.channel_capacity,
        Duration::from_millis(config.mqtt.reconnect_backoff_max_ms),
    ));
    let liveness: Arc<dyn LivenessProbe> = if config.liveness.disabled {
        tracing::warn!("liveness gate disabled");
        Arc::new(AlwaysReachable)
    } else {
        Arc::new(RedisPingProbe::new(
            config.liveness.address(),
            config.liveness.timeout(),
        ))
    };

    Ok(AppState {
        registry: SessionRegistry::new(store.clone(), connector),
        store,
        store_config,
        liveness,
    })
}
