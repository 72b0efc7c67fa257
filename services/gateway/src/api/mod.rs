//! Gateway HTTP API module.
//!
//! # Purpose
//! Exposes route handler modules plus the shared request gates: JSON body
//! extraction, required field checks, and the "client must be configured"
//! precondition.
pub mod error;
pub mod messages;
pub mod openapi;
pub mod sessions;
pub mod subscriptions;
pub mod system;
pub mod types;

use crate::api::error::{
    ApiError, RouteKind, api_not_found, api_state_conflict, api_validation_error,
};
use crate::app::AppState;
use axum::Json;
use axum::extract::{FromRequest, Request};
use serde::de::DeserializeOwned;

/// JSON request body whose rejections are reported as 400 validation errors.
///
/// A body that is not JSON, lacks the JSON content type, or carries a field
/// of the wrong type is malformed input, same as a missing field.
pub(crate) struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(request, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => {
                tracing::debug!(error = %rejection, "rejecting malformed request body");
                Err(api_validation_error(&rejection.body_text()))
            }
        }
    }
}

/// Return the trimmed-non-empty value of a required request field.
pub(crate) fn required_field(value: Option<String>, message: &str) -> Result<String, ApiError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(api_validation_error(message)),
    }
}

/// Reject requests for a client id that has no session in this process.
pub(crate) async fn ensure_configured(
    state: &AppState,
    client_id: &str,
    kind: RouteKind,
) -> Result<(), ApiError> {
    if state.registry.contains(client_id).await {
        return Ok(());
    }
    let message = format!("MQTT client {client_id} is not configured");
    Err(match kind {
        RouteKind::Write => api_state_conflict("not_configured", &message),
        RouteKind::Read => api_not_found(&message),
    })
}
