//! Session lifecycle API handlers.
//!
//! # Purpose
//! Creates, closes, and inspects client sessions. `POST /configure-mqtt` is
//! the only route that does not require the client to be configured already.
use crate::api::error::{ApiError, RouteKind, api_not_found, api_registry_error};
use crate::api::types::{CloseRequest, ConfigureRequest};
use crate::api::{ApiJson, ensure_configured, required_field};
use crate::app::AppState;
use crate::model::SessionInfo;
use crate::registry::CreateSession;
use axum::Json;
use axum::extract::{Path, State};

#[utoipa::path(
    post,
    path = "/configure-mqtt",
    tag = "sessions",
    request_body = ConfigureRequest,
    responses(
        (status = 200, description = "Client configured and connected", body = String, content_type = "text/plain"),
        (status = 400, description = "Missing fields or client already configured", body = crate::api::types::ErrorResponse),
        (status = 500, description = "Broker connection failed", body = crate::api::types::ErrorResponse)
    )
)]
/// Create a session and connect it to the requested broker.
///
/// # Errors
/// - 400 when `brokerUrl`/`clientId` are missing, options are malformed, or the
///   client id is already configured.
/// - 500 when the broker connection fails.
pub(crate) async fn configure_mqtt(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ConfigureRequest>,
) -> Result<String, ApiError> {
    const MISSING: &str = "Broker URL and Client ID are required";
    let broker_url = required_field(body.broker_url, MISSING)?;
    let client_id = required_field(body.client_id, MISSING)?;
    state
        .registry
        .create_session(CreateSession {
            client_id: client_id.clone(),
            broker_url,
            options: body.options,
        })
        .await
        .map_err(|err| api_registry_error(err, RouteKind::Write))?;
    Ok(format!(
        "MQTT client {client_id} configured and connected successfully"
    ))
}

#[utoipa::path(
    post,
    path = "/close-mqtt",
    tag = "sessions",
    request_body = CloseRequest,
    responses(
        (status = 200, description = "Session closed", body = String, content_type = "text/plain"),
        (status = 400, description = "Missing or unconfigured client", body = crate::api::types::ErrorResponse)
    )
)]
/// Disconnect a session and drop it from the registry.
///
/// The durable subscription record is kept, so configuring the same client id
/// again replays its subscriptions.
pub(crate) async fn close_mqtt(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<CloseRequest>,
) -> Result<String, ApiError> {
    let client_id = required_field(body.client_id, "Client ID is required")?;
    ensure_configured(&state, &client_id, RouteKind::Write).await?;
    state
        .registry
        .close_session(&client_id)
        .await
        .map_err(|err| api_registry_error(err, RouteKind::Write))?;
    Ok(format!("MQTT client {client_id} closed"))
}

#[utoipa::path(
    get,
    path = "/sessions/{client_id}",
    tag = "sessions",
    params(
        ("client_id" = String, Path, description = "Client identifier")
    ),
    responses(
        (status = 200, description = "Live session view", body = SessionInfo),
        (status = 404, description = "Client not configured", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn get_session(
    Path(client_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<SessionInfo>, ApiError> {
    ensure_configured(&state, &client_id, RouteKind::Read).await?;
    state
        .registry
        .session_info(&client_id)
        .await
        .map(Json)
        .ok_or_else(|| api_not_found(&format!("MQTT client {client_id} is not configured")))
}
