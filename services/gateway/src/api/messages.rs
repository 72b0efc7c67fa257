//! Message read-back API handler.
//!
//! # Purpose
//! Returns the stored log of one `(clientId, topic)` pair in arrival order.
//! Read-only; stored messages are never updated or deleted through the API.
//! Pages are walked by passing the previous response's `nextAfter` as `after`.
use crate::api::error::{ApiError, RouteKind, api_internal};
use crate::api::types::{MessageListResponse, MessageView, MessagesQuery};
use crate::api::{ensure_configured, required_field};
use crate::app::AppState;
use axum::Json;
use axum::extract::{Query, State};

pub const DEFAULT_PAGE_LIMIT: usize = 100;

#[utoipa::path(
    get,
    path = "/messages",
    tag = "messages",
    params(MessagesQuery),
    responses(
        (status = 200, description = "Stored messages in arrival order", body = MessageListResponse),
        (status = 400, description = "Missing client id or topic", body = crate::api::types::ErrorResponse),
        (status = 404, description = "Client not configured", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn list_messages(
    Query(query): Query<MessagesQuery>,
    State(state): State<AppState>,
) -> Result<Json<MessageListResponse>, ApiError> {
    const MISSING: &str = "Client ID and topic are required";
    let client_id = required_field(query.client_id, MISSING)?;
    let topic = required_field(query.topic, MISSING)?;
    ensure_configured(&state, &client_id, RouteKind::Read).await?;
    let limit = state
        .store_config
        .clamp_limit(query.limit.unwrap_or(DEFAULT_PAGE_LIMIT));
    let items = state
        .store
        .list_messages(&client_id, &topic, query.after, limit)
        .await
        .map_err(|err| api_internal("failed to list messages", &err))?;
    let next_after = match items.last() {
        Some(last) if items.len() == limit => Some(last.seq),
        _ => None,
    };
    Ok(Json(MessageListResponse {
        client_id,
        topic,
        items: items.into_iter().map(MessageView::from).collect(),
        next_after,
    }))
}
