//! API error types and helpers.
//!
//! # Purpose and responsibility
//! Centralizes HTTP error response construction so every gateway endpoint
//! returns the same error shape, and maps registry failures onto statuses.
//!
//! # Key invariants and assumptions
//! - Error responses include a stable `code` and a human-readable `message`.
//! - Caller mistakes and state conflicts are 400; broker, store, and cache
//!   failures are 500.
//! - A missing session is 400 on write routes and 404 on read routes.
//!
//! # Security considerations
//! - Internal errors log details server-side but return generic messages.
use crate::api::types::ErrorResponse;
use crate::registry::RegistryError;
use crate::store::StoreError;
use crate::transport::TransportError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;

/// Structured API error returned by handlers.
///
/// # Invariants
/// - `status` must match the semantics of `body.code`.
///
/// # Example
/// ```rust
/// use axum::http::StatusCode;
/// use gateway::api::error::ApiError;
/// use gateway::api::types::ErrorResponse;
///
/// let err = ApiError {
///     status: StatusCode::BAD_REQUEST,
///     body: ErrorResponse {
///         code: "validation_error".to_string(),
///         message: "Client ID is required".to_string(),
///         request_id: None,
///     },
/// };
/// ```
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Which kind of route is translating a registry error.
///
/// Write routes gate on configuration with a 400; read routes report a missing
/// session as 404.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Write,
    Read,
}

fn api_error(status: StatusCode, code: &str, message: &str) -> ApiError {
    ApiError {
        status,
        body: ErrorResponse {
            code: code.to_string(),
            message: message.to_string(),
            request_id: None,
        },
    }
}

/// Build a 404 Not Found error.
pub fn api_not_found(message: &str) -> ApiError {
    api_error(StatusCode::NOT_FOUND, "not_found", message)
}

/// Build a 400 Bad Request validation error.
///
/// # What it does
/// Returns an `ApiError` with code `validation_error`.
pub fn api_validation_error(message: &str) -> ApiError {
    // Client input failed validation or was malformed.
    api_error(StatusCode::BAD_REQUEST, "validation_error", message)
}

/// Build a 400 error for a request that conflicts with current session state.
///
/// # What it does
/// Returns an `ApiError` with a caller-provided conflict code.
pub fn api_state_conflict(code: &str, message: &str) -> ApiError {
    // Caller provides a specific code for precise client handling.
    api_error(StatusCode::BAD_REQUEST, code, message)
}

/// Build a 500 Internal Server Error from a store error.
///
/// # What it does
/// Logs the store error and returns a generic internal error response.
pub fn api_internal(message: &str, err: &StoreError) -> ApiError {
    // Log internal details server-side for debugging; return generic message.
    tracing::error!(error = ?err, "gateway storage error");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

/// Build a 500 error for a failed broker interaction.
pub fn api_transport(message: &str, err: &TransportError) -> ApiError {
    tracing::error!(error = %err, "MQTT transport error");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "transport_error", message)
}

/// Build the 500 returned when the liveness cache cannot be reached.
///
/// # What it does
/// Returns an `ApiError` with code `cache_unreachable`; no registry logic has
/// run when this is returned.
pub fn api_unavailable(message: &str) -> ApiError {
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "cache_unreachable",
        message,
    )
}

/// Translate a registry failure into an HTTP error.
///
/// # What it does
/// Applies the status mapping for the error taxonomy; `kind` decides how a
/// missing session is reported. Transport and store details are logged.
pub fn api_registry_error(err: RegistryError, kind: RouteKind) -> ApiError {
    let message = err.to_string();
    match err {
        RegistryError::InvalidConfiguration(_) => api_validation_error(&message),
        RegistryError::DuplicateClient(_) => api_state_conflict("already_configured", &message),
        RegistryError::AlreadySubscribed { .. } => {
            api_state_conflict("already_subscribed", &message)
        }
        RegistryError::NotSubscribed { .. } => api_state_conflict("not_subscribed", &message),
        RegistryError::SessionNotFound(_) => match kind {
            RouteKind::Write => api_state_conflict("not_configured", &message),
            RouteKind::Read => api_not_found(&message),
        },
        RegistryError::NotFound(_) => api_not_found("Client not found"),
        RegistryError::Transport(err) => api_transport("MQTT broker request failed", &err),
        RegistryError::Store(err) => api_internal("storage request failed", &err),
    }
}
