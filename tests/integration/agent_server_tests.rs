//! Integration tests for the in-VM agent API, driving a scripted CLI.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use authbridge::agent::{router, AgentState};
use authbridge::config::{AgentConfig, BrowserConfig, CliCommand};
use axum::routing::get;
use axum::Router;
use reqwest::StatusCode;
use serde_json::{json, Value};

const CLI_URL: &str = "https://auth.openai.com/oauth/authorize?client_id=app_cli&state=xyz";

struct Agent {
    base: String,
    http: reqwest::Client,
    home: tempfile::TempDir,
    _work: tempfile::TempDir,
    state: Arc<AgentState>,
}

impl Agent {
    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.http
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .expect("post")
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.http
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .expect("get")
    }

    fn write_codex_credentials(&self, body: &Value) {
        write_json(&self.home.path().join(".codex/auth.json"), body);
    }
}

fn write_json(path: &Path, body: &Value) {
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(path, body.to_string()).expect("write credentials");
}

async fn spawn_agent() -> Agent {
    let script = format!("printf 'Open this link to sign in:\\n{CLI_URL} \\n'; exec sleep 30");
    spawn_agent_with(script, |_| {}).await
}

/// Agent whose codex CLI runs `script` under `sh -c`; `tweak` adjusts the config.
async fn spawn_agent_with(script: String, tweak: impl FnOnce(&mut AgentConfig)) -> Agent {
    let home = tempfile::tempdir().expect("home");
    let work = tempfile::tempdir().expect("work");

    let mut cli = HashMap::new();
    cli.insert(
        "codex".to_owned(),
        CliCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script],
        },
    );
    let mut config = AgentConfig {
        home_dir: home.path().to_path_buf(),
        work_dir: work.path().to_path_buf(),
        start_wait_ms: 3_000,
        url_file_poll_ms: 200,
        browser: BrowserConfig {
            enabled: false,
            ..BrowserConfig::default()
        },
        cli,
        ..AgentConfig::default()
    };
    tweak(&mut config);
    let state = AgentState::new(config).expect("agent state");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind agent");
    let port = listener.local_addr().expect("addr").port();
    let app = router(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("agent serve");
    });

    Agent {
        base: format!("http://127.0.0.1:{port}"),
        http: reqwest::Client::new(),
        home,
        _work: work,
        state,
    }
}

async fn start(agent: &Agent, session_id: &str) -> Value {
    let resp = agent
        .post(
            "/auth/codex",
            json!({"sessionId": session_id, "debug": {"skipConnectivityChecks": true}}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    resp.json().await.expect("start body")
}

#[tokio::test]
async fn health_reports_active_sessions() {
    let agent = spawn_agent().await;
    let body: Value = agent.get("/health").await.json().await.expect("json");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["activeSessions"], 0);

    start(&agent, "s-health").await;
    let body: Value = agent.get("/health").await.json().await.expect("json");
    assert_eq!(body["activeSessions"], 1);
    agent.state.shutdown().await;
}

#[tokio::test]
async fn start_auth_returns_url_printed_by_cli() {
    let agent = spawn_agent().await;
    let body = start(&agent, "s-url").await;
    assert_eq!(body["success"], true);
    assert_eq!(body["sessionId"], "s-url");
    assert_eq!(body["oauthUrl"], CLI_URL);

    let resp = agent.get("/oauth-url?sessionId=s-url").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["oauthUrl"], CLI_URL);
    agent.state.shutdown().await;
}

#[tokio::test]
async fn repeated_start_reuses_the_running_cli() {
    let agent = spawn_agent().await;
    start(&agent, "s-twice").await;
    let again = start(&agent, "s-twice").await;
    assert_eq!(again["oauthUrl"], CLI_URL);
    assert_eq!(agent.state.sessions().len().await, 1);
    agent.state.shutdown().await;
}

#[tokio::test]
async fn credential_handover_flow() {
    let agent = spawn_agent().await;
    start(&agent, "s-creds").await;

    let resp = agent.get("/credentials/get?sessionId=s-creds").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "not completed yet");

    let status: Value = agent
        .get("/credentials/status?sessionId=s-creds")
        .await
        .json()
        .await
        .expect("json");
    assert_eq!(status["authenticated"], false);
    assert_eq!(status["waiting"], true);

    let credentials = json!({"tokens": {"access_token": "at", "refresh_token": "rt"}});
    agent.write_codex_credentials(&credentials);

    let status: Value = agent
        .get("/credentials/status?sessionId=s-creds")
        .await
        .json()
        .await
        .expect("json");
    assert_eq!(status["authenticated"], true);
    assert_eq!(status["provider"], "codex");
    assert!(status["path"]
        .as_str()
        .is_some_and(|p| p.ends_with(".codex/auth.json")));

    let resp = agent.get("/credentials/get?sessionId=s-creds").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["success"], true);
    assert_eq!(body["provider"], "codex");
    assert_eq!(body["credentials"], credentials);

    let resp = agent.get("/credentials/get?sessionId=s-creds").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND, "session forgotten after handover");
    assert_eq!(agent.state.sessions().len().await, 0);
}

#[tokio::test]
async fn session_query_is_validated() {
    let agent = spawn_agent().await;
    assert_eq!(agent.get("/oauth-url").await.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        agent.get("/credentials/status?sessionId=unknown").await.status(),
        StatusCode::NOT_FOUND
    );
    let resp = agent
        .post("/auth/emacs", json!({"sessionId": "s-bad"}))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json");
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_auth_reads_the_credential_file() {
    let agent = spawn_agent().await;
    let body: Value = agent.get("/test-auth/codex").await.json().await.expect("json");
    assert_eq!(body["valid"], false);

    agent.write_codex_credentials(&json!({"tokens": {"access_token": "at"}}));
    let body: Value = agent.get("/test-auth/codex").await.json().await.expect("json");
    assert_eq!(body["valid"], true);
    assert_eq!(body["provider"], "codex");
}

#[tokio::test]
async fn open_url_reports_disabled_browser() {
    let agent = spawn_agent().await;
    let resp = agent
        .post("/open-url", json!({"url": "https://example.com/login"}))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["success"], true);
    assert_eq!(body["method"], "disabled");
}

#[tokio::test]
async fn every_response_carries_cors_headers() {
    let agent = spawn_agent().await;
    let resp = agent.get("/health").await;
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );

    let preflight = agent
        .http
        .request(reqwest::Method::OPTIONS, format!("{}/auth/codex", agent.base))
        .send()
        .await
        .expect("options");
    assert_eq!(preflight.status(), StatusCode::OK);
    assert!(preflight
        .headers()
        .get("access-control-allow-methods")
        .is_some());
}

#[tokio::test]
async fn shutdown_kills_tracked_clis() {
    let agent = spawn_agent().await;
    start(&agent, "s-a").await;
    start(&agent, "s-b").await;
    assert_eq!(agent.state.shutdown().await, 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(agent.state.sessions().len().await, 0);
}

/// A loopback port with nothing listening on it.
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

#[tokio::test]
async fn oauth_url_waits_while_cli_has_printed_none() {
    let agent = spawn_agent_with("printf 'Starting login...\\n'; exec sleep 30".into(), |c| {
        c.start_wait_ms = 300;
    })
    .await;

    let started = start(&agent, "s-slow").await;
    assert_eq!(started["success"], true);
    assert!(started.get("oauthUrl").is_none());
    assert!(started["cliOutput"].is_string());

    let resp = agent.get("/oauth-url?sessionId=s-slow").await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["waiting"], true);
    assert!(body["message"].is_string());
    assert!(body["elapsedMs"].is_u64());

    assert_eq!(
        agent.get("/oauth-url?sessionId=unknown").await.status(),
        StatusCode::NOT_FOUND
    );
    agent.state.shutdown().await;
}

#[tokio::test]
async fn url_written_to_side_channel_is_picked_up() {
    let script = format!("printf '%s\\n' '{CLI_URL}' > \"$AUTHBRIDGE_URL_FILE\"; exec sleep 30");
    let agent = spawn_agent_with(script, |c| c.url_file_poll_ms = 2_000).await;

    start(&agent, "s-file").await;
    let mut url = Value::Null;
    for _ in 0..50 {
        let resp = agent.get("/oauth-url?sessionId=s-file").await;
        if resp.status() == StatusCode::OK {
            url = resp.json::<Value>().await.expect("json")["oauthUrl"].clone();
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(url, CLI_URL);
    agent.state.shutdown().await;
}

#[tokio::test]
async fn callback_serves_completion_page_when_cli_listener_is_down() {
    let port = closed_port();
    let agent = spawn_agent_with(String::new(), |c| c.callback_port = port).await;

    let resp = agent.get("/auth/callback?code=abc&state=xyz").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.text().await.expect("body");
    assert!(body.contains("Authentication Complete"));
}

#[tokio::test]
async fn callback_is_proxied_to_cli_listener() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind cli listener");
    let port = listener.local_addr().expect("addr").port();
    let cli_listener = Router::new().route(
        "/auth/callback",
        get(|axum::extract::RawQuery(query): axum::extract::RawQuery| async move {
            format!("cli saw {}", query.unwrap_or_default())
        }),
    );
    tokio::spawn(async move {
        axum::serve(listener, cli_listener).await.expect("cli listener");
    });

    let agent = spawn_agent_with(String::new(), |c| c.callback_port = port).await;
    let resp = agent.get("/auth/callback?code=abc&state=xyz").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.expect("body"), "cli saw code=abc&state=xyz");
}
