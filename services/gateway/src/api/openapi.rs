//! OpenAPI schema aggregation for the gateway API.
//!
//! # Purpose
//! Collects all routes and schema types into a single OpenAPI document for docs
//! and client generation.
use crate::api::{
    messages, sessions, subscriptions, system,
    types::{
        CloseRequest, ConfigureRequest, ErrorResponse, HealthStatus, MessageListResponse,
        MessageView, TopicRequest,
    },
};
use crate::model::{ConnectionState, SessionInfo};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "mqtt-gateway",
        version = "v1",
        description = "Multi-tenant MQTT session gateway HTTP API"
    ),
    paths(
        system::health_status,
        sessions::configure_mqtt,
        sessions::close_mqtt,
        sessions::get_session,
        subscriptions::subscribe,
        subscriptions::unsubscribe,
        subscriptions::get_subscriptions,
        messages::list_messages
    ),
    components(schemas(
        ErrorResponse,
        HealthStatus,
        ConfigureRequest,
        TopicRequest,
        CloseRequest,
        SessionInfo,
        ConnectionState,
        MessageView,
        MessageListResponse
    )),
    tags(
        (name = "system", description = "Health endpoints"),
        (name = "sessions", description = "MQTT client session lifecycle"),
        (name = "subscriptions", description = "Topic subscriptions"),
        (name = "messages", description = "Stored inbound messages")
    )
)]
pub struct ApiDoc;
