//! Integration tests for the push dispatcher's HTTP edge (spec.md §6, §8).
//!
//! Exercises the full router end to end: ACL enforcement, request
//! validation, registry lookups, and the token-store endpoints. Vendor
//! delivery itself (render -> retry -> APNs/FCM) is covered by the unit
//! tests in `renderers.rs`, `vendor_apns.rs`, `vendor_fcm.rs` and
//! `dispatcher.rs`; these tests stick to bindings that are absent or
//! invalid so no outbound network call is ever attempted.

use arc_swap::ArcSwap;
use axum::{routing::post, Router};
use axum_test::{TestServer, TestServerConfig, Transport};
use pushd::acl::AccessList;
use pushd::dispatcher::Dispatcher;
use pushd::handlers::{self, AppState};
use pushd::registry::Registry;
use pushd::store::FileStore;
use serde_json::json;
use std::sync::Arc;

fn empty_registry() -> Registry {
    Registry { bindings: Default::default(), apns_clients: Default::default(), fcm_clients: Default::default(), invalid: Vec::new() }
}

fn build_router(acl: AccessList, return_async: bool) -> Router {
    let registry = Arc::new(ArcSwap::from_pointee(empty_registry()));
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::load(dir.path().join("tokens.json")));
    std::mem::forget(dir); // keep the tempdir alive for the life of the test server
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), store));
    let state = AppState::new(registry, dispatcher, acl, return_async);

    Router::new()
        .route("/health", axum::routing::get(handlers::health))
        .route("/push", post(handlers::push))
        .route("/v2/tokens/:account", post(handlers::add_token).delete(handlers::remove_token))
        .route("/v2/tokens/:account/push", post(handlers::fanout_push_account))
        .route("/v2/tokens/:account/push/:device", post(handlers::fanout_push_device))
        .with_state(state)
}

/// `ConnectInfo<SocketAddr>` only resolves over a real socket, so every
/// test server here runs on an actual loopback port rather than axum-test's
/// default mock transport.
fn test_server(acl: AccessList, return_async: bool) -> TestServer {
    let config = TestServerConfig { transport: Some(Transport::HttpRandomPort), ..Default::default() };
    TestServer::new_with_config(build_router(acl, return_async), config).unwrap()
}

fn valid_push_body() -> serde_json::Value {
    json!({
        "app-id": "com.example.app.dev",
        "platform": "ios",
        "event": "incoming_session",
        "token": "AABBCCDD",
        "call-id": "call-42",
        "from": "sip:alice@example.com",
        "to": "sip:bob@example.com",
        "media-type": "audio",
    })
}

#[tokio::test]
async fn health_check_is_not_gated_by_acl() {
    // An allowlist that would deny the loopback test client must not
    // affect the liveness probe.
    let acl = AccessList::parse(&["10.0.0.0/8".to_string()]).unwrap();
    let server = test_server(acl, false);
    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn push_against_unknown_app_is_not_configured() {
    let server = test_server(AccessList::default(), false);
    let response = server.post("/push").json(&valid_push_body()).await;
    response.assert_status(axum::http::StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], 404);
}

#[tokio::test]
async fn push_missing_required_field_is_a_validation_error() {
    let mut body = valid_push_body();
    body.as_object_mut().unwrap().remove("call-id");

    let server = test_server(AccessList::default(), false);
    let response = server.post("/push").json(&body).await;
    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert_eq!(body["description"], "Field 'call-id' required");
}

#[tokio::test]
async fn push_from_outside_allowlist_is_denied() {
    // Loopback test clients always connect from 127.0.0.1; an allowlist
    // that excludes it must deny every request (spec.md §8 scenario 6).
    let acl = AccessList::parse(&["10.0.0.0/8".to_string()]).unwrap();
    let server = test_server(acl, false);
    let response = server.post("/push").json(&valid_push_body()).await;
    response.assert_status(axum::http::StatusCode::FORBIDDEN);
    let body: serde_json::Value = response.json();
    assert_eq!(body["description"], "access denied by access list");
}

#[tokio::test]
async fn push_async_mode_returns_202_immediately() {
    let server = test_server(AccessList::default(), true);
    let response = server.post("/push").json(&valid_push_body()).await;
    response.assert_status(axum::http::StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], 202);
    assert_eq!(body["description"], "accepted for delivery");
}

#[tokio::test]
async fn add_then_remove_device_token_round_trips() {
    let server = test_server(AccessList::default(), false);

    let add_body = json!({
        "app-id": "com.example.app",
        "platform": "ios",
        "token": "AABBCCDD",
        "device-id": "dev-1",
    });
    let response = server.post("/v2/tokens/alice@example.com").json(&add_body).await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["token"], "AABBCCDD");
    assert_eq!(body["platform"], "apple");

    let remove_body = json!({ "app-id": "com.example.app", "device-id": "dev-1" });
    let response = server.delete("/v2/tokens/alice@example.com").json(&remove_body).await;
    response.assert_status_ok();
}

#[tokio::test]
async fn remove_absent_device_is_idempotent_404() {
    let server = test_server(AccessList::default(), false);
    let remove_body = json!({ "app-id": "com.example.app", "device-id": "no-such-device" });

    let first = server.delete("/v2/tokens/nobody@example.com").json(&remove_body).await;
    first.assert_status(axum::http::StatusCode::NOT_FOUND);

    let second = server.delete("/v2/tokens/nobody@example.com").json(&remove_body).await;
    second.assert_status(axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn fanout_against_unregistered_account_is_user_not_found() {
    let server = test_server(AccessList::default(), false);
    let push_body = json!({
        "event": "incoming_session",
        "call-id": "call-1",
        "from": "sip:a@b",
        "to": "sip:c@d",
        "media-type": "audio",
    });
    let response = server.post("/v2/tokens/nobody@example.com/push").json(&push_body).await;
    response.assert_status(axum::http::StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json();
    assert_eq!(body["description"], "user not found");
}

#[tokio::test]
async fn fanout_device_not_found_when_filter_matches_nothing() {
    let server = test_server(AccessList::default(), false);

    let add_body = json!({
        "app-id": "com.example.app",
        "platform": "ios",
        "token": "AABBCCDD",
        "device-id": "dev-1",
    });
    server.post("/v2/tokens/alice@example.com").json(&add_body).await.assert_status_ok();

    let push_body = json!({
        "event": "incoming_session",
        "call-id": "call-1",
        "from": "sip:a@b",
        "to": "sip:c@d",
        "media-type": "audio",
    });
    let response = server.post("/v2/tokens/alice@example.com/push/dev-does-not-exist").json(&push_body).await;
    response.assert_status(axum::http::StatusCode::NOT_FOUND);
}
