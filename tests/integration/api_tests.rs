//! Integration tests for the orchestrator HTTP API.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use authbridge::api;
use authbridge::models::provider::Provider;
use authbridge::orchestrator::AuthService;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::test_helpers::{
    harness, harness_with, wait_for_session, wait_for_terminal, FakeVmProvider, MockAgent,
    MOCK_OAUTH_URL,
};

async fn serve(service: Arc<AuthService>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind api");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        axum::serve(listener, api::router(service)).await.expect("api serve");
    });
    format!("http://127.0.0.1:{port}")
}

#[tokio::test]
async fn health_answers_ok() {
    let h = harness().await;
    let base = serve(Arc::clone(&h.service)).await;
    let body: Value = reqwest::get(format!("{base}/health"))
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn start_rejects_unknown_provider() {
    let h = harness().await;
    let base = serve(Arc::clone(&h.service)).await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/api/auth/start"))
        .json(&json!({"userId": "u1", "provider": "copilot"}))
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json");
    assert!(body["error"].as_str().is_some_and(|e| e.starts_with("validation")));
}

#[tokio::test]
async fn start_rejects_malformed_body() {
    let h = harness().await;
    let base = serve(Arc::clone(&h.service)).await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/api/auth/start"))
        .json(&json!({"provider": "codex"}))
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn start_then_poll_until_completed() {
    let h = harness().await;
    let base = serve(Arc::clone(&h.service)).await;
    let http = reqwest::Client::new();

    let resp = http
        .post(format!("{base}/api/auth/start"))
        .json(&json!({"userId": "u1", "provider": "codex"}))
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status(), StatusCode::OK);
    let started: Value = resp.json().await.expect("json");
    assert_eq!(started["success"], true);
    assert_eq!(started["provider"], "codex");
    assert!(started["novncURL"].is_null());
    assert!(started["browserIP"].is_null());
    let session_id = started["sessionId"].as_str().expect("session id").to_owned();

    wait_for_terminal(&h.service, &session_id).await;
    let session: Value = http
        .get(format!("{base}/api/auth/session/{session_id}"))
        .send()
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(session["status"], "completed");
    assert_eq!(session["auth_url"], MOCK_OAUTH_URL);

    let listed: Value = http
        .get(format!("{base}/api/auth/credentials/u1"))
        .send()
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(listed["success"], true);
    let entries = listed["credentials"].as_array().expect("array");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["provider"], "codex");
    assert!(entries[0].get("ciphertext").is_none());
    assert!(!listed.to_string().contains("refresh_token"));
}

#[tokio::test]
async fn unknown_session_is_404() {
    let h = harness().await;
    let base = serve(Arc::clone(&h.service)).await;
    let http = reqwest::Client::new();

    let resp = http
        .get(format!("{base}/api/auth/session/nope"))
        .send()
        .await
        .expect("get");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = http
        .post(format!("{base}/api/auth/session/nope/cancel"))
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_over_http() {
    let agent = MockAgent::default();
    agent.never_authenticate.store(true, Ordering::SeqCst);
    let h = harness_with(agent, FakeVmProvider::default(), |_| {}).await;
    let base = serve(Arc::clone(&h.service)).await;
    let http = reqwest::Client::new();

    let session = h
        .service
        .start_authentication("u1", Provider::Codex, None)
        .await
        .expect("start");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let body: Value = http
        .post(format!("{base}/api/auth/session/{}/cancel", session.id))
        .send()
        .await
        .expect("post")
        .json()
        .await
        .expect("json");
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "cancelled");
}

#[tokio::test]
async fn oauth_url_and_open_url_are_relayed() {
    let agent = MockAgent::default();
    agent.never_authenticate.store(true, Ordering::SeqCst);
    let h = harness_with(agent, FakeVmProvider::default(), |_| {}).await;
    let base = serve(Arc::clone(&h.service)).await;
    let http = reqwest::Client::new();

    let session = h
        .service
        .start_authentication("u1", Provider::Codex, None)
        .await
        .expect("start");
    wait_for_session(&h.service, &session.id, Duration::from_secs(5), |s| {
        s.vm_ip.is_some()
    })
    .await;

    let body: Value = http
        .get(format!("{base}/api/auth/session/{}/oauth-url", session.id))
        .send()
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(body["oauthUrl"], MOCK_OAUTH_URL);

    let resp = http
        .post(format!("{base}/api/auth/session/{}/open-url", session.id))
        .json(&json!({"url": "https://accounts.google.com/o/oauth2/auth?x=1"}))
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        *h.agent.opened.lock().expect("lock"),
        vec!["https://accounts.google.com/o/oauth2/auth?x=1".to_owned()]
    );
    h.ct.cancel();
}

#[tokio::test]
async fn display_handshake_is_stored_with_the_session() {
    let h = harness().await;
    let base = serve(Arc::clone(&h.service)).await;
    let http = reqwest::Client::new();
    let offer = json!({"type": "offer", "sdp": "v=0"});

    let started: Value = http
        .post(format!("{base}/api/auth/start"))
        .json(&json!({"userId": "u1", "provider": "gemini_cli", "webrtcOffer": offer}))
        .send()
        .await
        .expect("post")
        .json()
        .await
        .expect("json");
    let session_id = started["sessionId"].as_str().expect("session id");

    let stored: Value = http
        .get(format!("{base}/api/auth/session/{session_id}/display-handshake"))
        .send()
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(stored, offer);
    h.ct.cancel();
}

#[tokio::test]
async fn validate_unknown_credential_is_not_found() {
    let h = harness().await;
    let base = serve(Arc::clone(&h.service)).await;
    let http = reqwest::Client::new();

    let body: Value = http
        .get(format!("{base}/api/auth/validate/u1/codex"))
        .send()
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(body["valid"], false);
    assert_eq!(body["reason"], "not_found");
    assert_eq!(body["provider"], "codex");

    let resp = http
        .get(format!("{base}/api/auth/validate/u1/copilot"))
        .send()
        .await
        .expect("get");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn validate_probes_the_worker() {
    let h = harness().await;
    h.service
        .store_credentials("u1", Provider::Codex, &json!({"tokens": {"access_token": "at"}}))
        .await
        .expect("store");

    let report = h.service.validate_credentials("u1", "codex").await.expect("validate");
    assert!(report.valid);
    assert!(!report.untested);

    h.agent.test_auth_valid.store(false, Ordering::SeqCst);
    let report = h.service.validate_credentials("u1", "codex").await.expect("validate");
    assert!(!report.valid);
    assert_eq!(report.reason.as_deref(), Some("rejected"));
    let listed = h.service.list_credentials("u1").await.expect("list");
    assert!(!listed[0].is_valid);
}
