//! Subscription API handlers.
//!
//! # Purpose
//! Subscribes and unsubscribes configured clients and reads their durable
//! subscription set.
//!
//! # Notes
//! `GET /subscriptions` reads the durable record, not the live mirror: a live
//! session that never subscribed reports 404.
use crate::api::error::{ApiError, RouteKind, api_registry_error};
use crate::api::types::{ClientQuery, TopicRequest};
use crate::api::{ApiJson, ensure_configured, required_field};
use crate::app::AppState;
use axum::Json;
use axum::extract::{Query, State};

const MISSING_TOPIC_FIELDS: &str = "Client ID and topic are required";

#[utoipa::path(
    post,
    path = "/subscribe",
    tag = "subscriptions",
    request_body = TopicRequest,
    responses(
        (status = 200, description = "Subscribed", body = String, content_type = "text/plain"),
        (status = 400, description = "Missing fields, unconfigured client, or already subscribed", body = crate::api::types::ErrorResponse),
        (status = 500, description = "Broker or storage failure", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn subscribe(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<TopicRequest>,
) -> Result<String, ApiError> {
    let client_id = required_field(body.client_id, MISSING_TOPIC_FIELDS)?;
    let topic = required_field(body.topic, MISSING_TOPIC_FIELDS)?;
    ensure_configured(&state, &client_id, RouteKind::Write).await?;
    state
        .registry
        .subscribe(&client_id, &topic)
        .await
        .map_err(|err| api_registry_error(err, RouteKind::Write))?;
    Ok(format!("Client {client_id} subscribed to {topic}"))
}

#[utoipa::path(
    post,
    path = "/unsubscribe",
    tag = "subscriptions",
    request_body = TopicRequest,
    responses(
        (status = 200, description = "Unsubscribed", body = String, content_type = "text/plain"),
        (status = 400, description = "Missing fields, unconfigured client, or not subscribed", body = crate::api::types::ErrorResponse),
        (status = 500, description = "Broker or storage failure", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn unsubscribe(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<TopicRequest>,
) -> Result<String, ApiError> {
    let client_id = required_field(body.client_id, MISSING_TOPIC_FIELDS)?;
    let topic = required_field(body.topic, MISSING_TOPIC_FIELDS)?;
    ensure_configured(&state, &client_id, RouteKind::Write).await?;
    state
        .registry
        .unsubscribe(&client_id, &topic)
        .await
        .map_err(|err| api_registry_error(err, RouteKind::Write))?;
    Ok(format!("Client {client_id} unsubscribed from {topic}"))
}

#[utoipa::path(
    get,
    path = "/subscriptions",
    tag = "subscriptions",
    params(ClientQuery),
    responses(
        (status = 200, description = "Durable subscription set", body = [String]),
        (status = 400, description = "Missing client id", body = crate::api::types::ErrorResponse),
        (status = 404, description = "Client not configured or no record", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn get_subscriptions(
    Query(query): Query<ClientQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<String>>, ApiError> {
    let client_id = required_field(query.client_id, "Client ID is required")?;
    ensure_configured(&state, &client_id, RouteKind::Read).await?;
    let topics = state
        .registry
        .get_subscriptions(&client_id)
        .await
        .map_err(|err| api_registry_error(err, RouteKind::Read))?;
    Ok(Json(topics))
}
