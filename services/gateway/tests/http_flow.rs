mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use common::{TestApp, read_json, read_text, test_app};
use gateway::store::{MessageStore, SubscriptionStore};
use http_helpers::{get_request, json_request};
use serde_json::json;
use std::time::Duration;
use tower::ServiceExt;

const BROKER: &str = "mqtt://loopback:1883";

async fn send(app: &TestApp, request: Request<Body>) -> Response {
    app.router.clone().oneshot(request).await.expect("response")
}

async fn configure(app: &TestApp, client_id: &str) -> Response {
    send(
        app,
        json_request(
            "POST",
            "/configure-mqtt",
            json!({ "brokerUrl": BROKER, "options": {}, "clientId": client_id }),
        ),
    )
    .await
}

async fn topic_call(app: &TestApp, path: &str, client_id: &str, topic: &str) -> Response {
    send(
        app,
        json_request("POST", path, json!({ "clientId": client_id, "topic": topic })),
    )
    .await
}

async fn wait_for_live_subscriptions(app: &TestApp, client_id: &str, expected: &[&str]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let info = app.registry.session_info(client_id).await.expect("session");
        if info.subscriptions == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "live subscriptions stuck at {:?}",
            info.subscriptions
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn health_with_no_sessions_is_ok_and_empty() {
    let app = test_app();
    let response = send(&app, get_request("/api/health/status")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["status"], "OK");
    assert_eq!(body["connectedClients"], json!([]));
    assert!(body["timestamp"].as_str().is_some());
}

#[tokio::test]
async fn configure_validates_and_rejects_duplicates() {
    let app = test_app();

    let response = send(
        &app,
        json_request("POST", "/configure-mqtt", json!({ "clientId": "c1" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["code"], "validation_error");
    assert_eq!(body["message"], "Broker URL and Client ID are required");

    let response = configure(&app, "c1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        read_text(response).await,
        "MQTT client c1 configured and connected successfully"
    );

    let response = configure(&app, "c1").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["code"], "already_configured");
    assert_eq!(body["message"], "MQTT client c1 is already configured");

    let response = send(&app, get_request("/api/health/status")).await;
    assert_eq!(read_json(response).await["connectedClients"], json!(["c1"]));
}

#[tokio::test]
async fn configure_reports_bad_endpoint_and_refused_broker() {
    let app = test_app();
    let response = send(
        &app,
        json_request(
            "POST",
            "/configure-mqtt",
            json!({ "brokerUrl": "http://nope", "clientId": "c1" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.connector.refuse_broker(BROKER);
    let response = configure(&app, "c1").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(read_json(response).await["code"], "transport_error");
    assert!(!app.registry.contains("c1").await);
}

#[tokio::test]
async fn write_routes_require_configuration() {
    let app = test_app();
    for path in ["/subscribe", "/unsubscribe"] {
        let response = topic_call(&app, path, "ghost", "a/b").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{path}");
        let body = read_json(response).await;
        assert_eq!(body["code"], "not_configured");
        assert_eq!(body["message"], "MQTT client ghost is not configured");
    }
    let response = send(
        &app,
        json_request("POST", "/close-mqtt", json!({ "clientId": "ghost" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        &app,
        json_request("POST", "/subscribe", json!({ "clientId": "c1" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        read_json(response).await["message"],
        "Client ID and topic are required"
    );
}

#[tokio::test]
async fn malformed_bodies_are_validation_errors() {
    let app = test_app();
    assert_eq!(configure(&app, "c1").await.status(), StatusCode::OK);

    let without_content_type = Request::builder()
        .method("POST")
        .uri("/subscribe")
        .body(Body::from(r#"{"clientId":"c1","topic":"a"}"#))
        .expect("request");
    let wrong_type = json_request(
        "POST",
        "/subscribe",
        json!({ "clientId": "c1", "topic": ["a"] }),
    );
    let not_json = Request::builder()
        .method("POST")
        .uri("/configure-mqtt")
        .header("content-type", "application/json")
        .body(Body::from("{brokerUrl"))
        .expect("request");
    let wrong_close = json_request("POST", "/close-mqtt", json!({ "clientId": 7 }));

    for request in [without_content_type, wrong_type, not_json, wrong_close] {
        let uri = request.uri().clone();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(read_json(response).await["code"], "validation_error");
    }
    assert!(app.connector.broker_filters("c1").is_empty());
    assert!(app.registry.contains("c1").await);
}

#[tokio::test]
async fn read_routes_report_missing_clients() {
    let app = test_app();
    let response = send(&app, get_request("/subscriptions")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&app, get_request("/subscriptions?clientId=ghost")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, get_request("/sessions/ghost")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, get_request("/messages?clientId=ghost&topic=a")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn fresh_session_has_no_durable_record() {
    let app = test_app();
    assert_eq!(configure(&app, "c1").await.status(), StatusCode::OK);
    let response = send(&app, get_request("/subscriptions?clientId=c1")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(read_json(response).await["message"], "Client not found");
}

#[tokio::test]
async fn subscribe_unsubscribe_round_trip() {
    let app = test_app();
    assert_eq!(configure(&app, "c1").await.status(), StatusCode::OK);

    let response = topic_call(&app, "/subscribe", "c1", "a/b").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_text(response).await, "Client c1 subscribed to a/b");

    let response = topic_call(&app, "/subscribe", "c1", "a/b").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await["code"], "already_subscribed");

    let response = send(&app, get_request("/subscriptions?clientId=c1")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await, json!(["a/b"]));

    let response = send(&app, get_request("/sessions/c1")).await;
    let body = read_json(response).await;
    assert_eq!(body["state"], "connected");
    assert_eq!(body["brokerUrl"], BROKER);
    assert_eq!(body["subscriptions"], json!(["a/b"]));

    let response = topic_call(&app, "/unsubscribe", "c1", "x/y").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["code"], "not_subscribed");
    assert_eq!(body["message"], "client c1 is not subscribed to topic x/y");

    let response = topic_call(&app, "/unsubscribe", "c1", "a/b").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_text(response).await, "Client c1 unsubscribed from a/b");

    let response = send(&app, get_request("/subscriptions?clientId=c1")).await;
    assert_eq!(read_json(response).await, json!([]));
}

#[tokio::test]
async fn broker_rejection_is_a_server_error_without_side_effects() {
    let app = test_app();
    assert_eq!(configure(&app, "c1").await.status(), StatusCode::OK);
    app.connector.reject_topic("forbidden/#");

    let response = topic_call(&app, "/subscribe", "c1", "forbidden/#").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(read_json(response).await["code"], "transport_error");
    assert!(app.store.get_subscriptions("c1").await.expect("get").is_none());
}

#[tokio::test]
async fn inbound_messages_are_readable_in_order() {
    let app = test_app();
    assert_eq!(configure(&app, "c1").await.status(), StatusCode::OK);
    assert_eq!(
        topic_call(&app, "/subscribe", "c1", "sensors/+").await.status(),
        StatusCode::OK
    );
    for reading in ["20.5", "21.0", "21.5"] {
        assert!(app.connector.publish("c1", "sensors/t1", reading));
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let body = loop {
        let response = send(&app, get_request("/messages?clientId=c1&topic=sensors/t1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        if body["items"].as_array().map(Vec::len) == Some(3) {
            break body;
        }
        assert!(tokio::time::Instant::now() < deadline, "messages not stored");
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    let payloads: Vec<_> = body["items"]
        .as_array()
        .expect("items")
        .iter()
        .map(|item| item["payload"].as_str().expect("payload").to_string())
        .collect();
    assert_eq!(payloads, vec!["20.5", "21.0", "21.5"]);
    assert_eq!(body["topic"], "sensors/t1");

    assert!(body["nextAfter"].is_null());

    let response = send(&app, get_request("/messages?clientId=c1&topic=sensors/t1&limit=1")).await;
    let body = read_json(response).await;
    assert_eq!(body["items"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["items"][0]["payloadBase64"], "MjAuNQ==");
}

#[tokio::test]
async fn message_pages_follow_the_cursor() {
    let app = test_app();
    assert_eq!(configure(&app, "c1").await.status(), StatusCode::OK);
    assert_eq!(
        topic_call(&app, "/subscribe", "c1", "t").await.status(),
        StatusCode::OK
    );
    for idx in 0..5 {
        assert!(app.connector.publish("c1", "t", format!("m{idx}")));
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while app.store.list_messages("c1", "t", None, 10).await.expect("list").len() < 5 {
        assert!(tokio::time::Instant::now() < deadline, "messages not stored");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut payloads = Vec::new();
    let mut uri = "/messages?clientId=c1&topic=t&limit=2".to_string();
    let mut pages = 0;
    loop {
        let response = send(&app, get_request(&uri)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        pages += 1;
        for item in body["items"].as_array().expect("items") {
            payloads.push(item["payload"].as_str().expect("payload").to_string());
        }
        match body["nextAfter"].as_u64() {
            Some(after) => uri = format!("/messages?clientId=c1&topic=t&limit=2&after={after}"),
            None => break,
        }
    }
    assert_eq!(payloads, vec!["m0", "m1", "m2", "m3", "m4"]);
    assert_eq!(pages, 3);
}

#[tokio::test]
async fn close_and_reconfigure_restores_subscriptions() {
    let app = test_app();
    assert_eq!(configure(&app, "c1").await.status(), StatusCode::OK);
    assert_eq!(
        topic_call(&app, "/subscribe", "c1", "a/b").await.status(),
        StatusCode::OK
    );

    let response = send(
        &app,
        json_request("POST", "/close-mqtt", json!({ "clientId": "c1" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_text(response).await, "MQTT client c1 closed");
    let response = send(&app, get_request("/api/health/status")).await;
    assert_eq!(read_json(response).await["connectedClients"], json!([]));

    assert_eq!(configure(&app, "c1").await.status(), StatusCode::OK);
    wait_for_live_subscriptions(&app, "c1", &["a/b"]).await;
    assert_eq!(app.connector.broker_filters("c1"), vec!["a/b"]);
}

#[tokio::test]
async fn unreachable_cache_blocks_every_route() {
    let app = test_app();
    assert_eq!(configure(&app, "c1").await.status(), StatusCode::OK);
    app.probe.set_reachable(false);

    let requests = vec![
        get_request("/api/health/status"),
        get_request("/subscriptions?clientId=c1"),
        get_request("/sessions/c1"),
        json_request(
            "POST",
            "/configure-mqtt",
            json!({ "brokerUrl": BROKER, "clientId": "c2" }),
        ),
        json_request("POST", "/subscribe", json!({ "clientId": "c1", "topic": "a" })),
    ];
    for request in requests {
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(read_json(response).await["code"], "cache_unreachable");
    }
    assert!(!app.registry.contains("c2").await);
    assert!(app.connector.broker_filters("c1").is_empty());

    let response = send(&app, get_request("/openapi.json")).await;
    assert_eq!(response.status(), StatusCode::OK);

    app.probe.set_reachable(true);
    let response = send(&app, get_request("/api/health/status")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn openapi_lists_gateway_routes() {
    let app = test_app();
    let response = send(&app, get_request("/openapi.json")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    let paths = body["paths"].as_object().expect("paths");
    for path in [
        "/configure-mqtt",
        "/subscribe",
        "/unsubscribe",
        "/subscriptions",
        "/close-mqtt",
        "/sessions/{client_id}",
        "/messages",
        "/api/health/status",
    ] {
        assert!(paths.contains_key(path), "missing {path}");
    }
}
