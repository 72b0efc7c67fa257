//! Gateway HTTP application wiring.
//!
//! # Purpose
//! Builds the Axum router, configures middleware, and defines the shared
//! application state injected into handlers.
//!
//! # Notes
//! Every API route sits behind the liveness gate: when the cache probe fails the
//! request is answered with 500 before any handler runs. The OpenAPI document
//! and Swagger UI are not gated.
use crate::api;
use crate::api::error::api_unavailable;
use crate::api::openapi::ApiDoc;
use crate::liveness::LivenessProbe;
use crate::observability;
use crate::registry::SessionRegistry;
use crate::store::{GatewayStore, StoreConfig};
use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use utoipa::OpenApi;

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub store: Arc<dyn GatewayStore>,
    pub store_config: StoreConfig,
    pub liveness: Arc<dyn LivenessProbe>,
}

async fn require_cache(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.liveness.check_reachable().await {
        return next.run(request).await;
    }
    metrics::counter!("gateway_liveness_failures_total").increment(1);
    tracing::error!(uri = %request.uri(), "rejecting request: cache is not reachable");
    api_unavailable("Redis is not connected").into_response()
}

pub fn build_router(state: AppState) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            let parent = observability::trace_context_from_headers(request.headers());
            let span = tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version()
            );
            span.set_parent(parent);
            span
        });

    Router::new()
        .route("/configure-mqtt", post(api::sessions::configure_mqtt))
        .route("/close-mqtt", post(api::sessions::close_mqtt))
        .route("/sessions/:client_id", get(api::sessions::get_session))
        .route("/subscribe", post(api::subscriptions::subscribe))
        .route("/unsubscribe", post(api::subscriptions::unsubscribe))
        .route("/subscriptions", get(api::subscriptions::get_subscriptions))
        .route("/messages", get(api::messages::list_messages))
        .route("/api/health/status", get(api::system::health_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_cache))
        .merge(utoipa_swagger_ui::SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(trace_layer)
        .with_state(state)
}
