//! Health API handler.
//!
//! # Purpose and responsibility
//! Reports the set of sessions held by this process. Not gated on client
//! configuration; the liveness gate still applies.
//!
//! # Key invariants and assumptions
//! - `connectedClients` lists every registry entry, whatever its connection
//!   state, sorted by client id.
use crate::api::types::HealthStatus;
use crate::app::AppState;
use axum::Json;
use axum::extract::State;

#[utoipa::path(
    get,
    path = "/api/health/status",
    tag = "system",
    responses(
        (status = 200, description = "Gateway health", body = HealthStatus),
        (status = 500, description = "Liveness cache unreachable", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn health_status(State(state): State<AppState>) -> Json<HealthStatus> {
    let snapshot = state.registry.health().await;
    Json(HealthStatus {
        status: "OK".to_string(),
        connected_clients: snapshot.connected_clients,
        timestamp: snapshot.timestamp,
    })
}
