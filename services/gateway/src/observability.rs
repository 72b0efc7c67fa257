//! Logging, trace propagation, and metrics for the gateway.
//!
//! # Purpose
//! - `tracing` output filtered by `RUST_LOG` (default `info`).
//! - Spans exported over OTLP when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//! - W3C trace context accepted on inbound HTTP requests.
//! - A Prometheus recorder for every `gateway_*` metric, rendered at `/metrics`.
//!
//! # Notes
//! Setup runs once per process; later calls return the same metrics handle.
//! Cluster workers tag their spans with `service.worker.id`.
use crate::cluster;
use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::propagation::Extractor;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

static SUBSCRIBER: OnceLock<()> = OnceLock::new();
static PROPAGATOR: OnceLock<()> = OnceLock::new();
static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the log subscriber, the trace propagator, and the metrics recorder.
///
/// # Errors
/// - Another Prometheus recorder already owns the process-global slot.
pub fn init_observability(service_name: &str) -> anyhow::Result<PrometheusHandle> {
    install_propagator();
    SUBSCRIBER.get_or_init(|| install_subscriber(service_name));
    let handle = match RECORDER.get() {
        Some(handle) => handle.clone(),
        None => {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .context("install metrics recorder")?;
            RECORDER.get_or_init(|| handle).clone()
        }
    };
    describe_metrics();
    Ok(handle)
}

fn install_subscriber(service_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    let installed = match span_exporter(service_name) {
        Some(provider) => {
            let tracer = provider.tracer(service_name.to_string());
            base.with(tracing_opentelemetry::layer().with_tracer(tracer)).try_init()
        }
        None => base.try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

fn span_exporter(service_name: &str) -> Option<SdkTracerProvider> {
    std::env::var(OTLP_ENDPOINT_ENV).ok()?;
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()
        .ok()?;
    let resource = Resource::builder_empty()
        .with_attributes(resource_attributes(service_name))
        .build();
    Some(
        SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build(),
    )
}

fn resource_attributes(service_name: &str) -> Vec<KeyValue> {
    let mut attrs = vec![KeyValue::new("service.name", service_name.to_string())];
    let instance =
        std::env::var("MQTT_GATEWAY_INSTANCE_ID").or_else(|_| std::env::var("HOSTNAME"));
    if let Ok(instance) = instance {
        attrs.push(KeyValue::new("service.instance.id", instance));
    }
    if let Some(worker) = cluster::worker_id() {
        attrs.push(KeyValue::new("service.worker.id", worker));
    }
    attrs
}

fn describe_metrics() {
    metrics::describe_gauge!("gateway_sessions_active", "Sessions held by the registry");
    metrics::describe_counter!(
        "gateway_session_state_transitions_total",
        "Session connection state transitions by target state"
    );
    metrics::describe_counter!("gateway_subscribe_total", "Subscribe requests by result");
    metrics::describe_counter!("gateway_unsubscribe_total", "Unsubscribe requests by result");
    metrics::describe_counter!(
        "gateway_messages_routed_total",
        "Inbound messages handed to the message store by result"
    );
    metrics::describe_counter!(
        "gateway_inbound_dropped_total",
        "Inbound messages dropped because a session's queue was full"
    );
    metrics::describe_counter!(
        "gateway_messages_evicted_total",
        "Messages evicted from full in-memory logs"
    );
    metrics::describe_counter!(
        "gateway_resubscribe_failures_total",
        "Topics that could not be restored by a resubscribe pass"
    );
    metrics::describe_counter!(
        "gateway_liveness_failures_total",
        "Requests rejected because the liveness cache was unreachable"
    );
    metrics::describe_gauge!("gateway_cache_reachable", "Last background cache probe result");
    metrics::describe_gauge!("gateway_message_logs_total", "Distinct message logs in memory");
}

fn install_propagator() {
    PROPAGATOR.get_or_init(|| {
        global::set_text_map_propagator(TraceContextPropagator::new());
    });
}

/// Parent context carried by `traceparent`/`tracestate` request headers.
pub fn trace_context_from_headers(headers: &axum::http::HeaderMap) -> opentelemetry::Context {
    install_propagator();
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}

struct HeaderExtractor<'a>(&'a axum::http::HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}

/// Serve `GET /metrics` on `listener` until the task is dropped or aborted.
pub async fn serve_metrics(handle: PrometheusHandle, listener: TcpListener) -> std::io::Result<()> {
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    );
    axum::serve(listener, app.into_make_service()).await
}
