//! In-VM agent HTTP API.
//!
//! One listener multiplexes every login session in the VM. Each session's
//! CLI is its own process on its own pseudo-terminal; output is pumped
//! from a reader thread into an async task that answers prompts and
//! watches for the authorization URL.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, RawQuery, Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CONTENT_TYPE,
};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::browser::BrowserDriver;
use super::launcher::{
    apply_network_override, install_intercept_script, probe_connectivity, spawn_cli, url_file_path,
    SpawnedCli,
};
use super::registry::{AgentSession, AgentSessions, BrowserState, PtyWriter};
use super::url_capture::{poll_url_file, UrlMatcher};
use crate::api::error::json_body;
use crate::config::AgentConfig;
use crate::models::provider::Provider;
use crate::protocol::{
    CredentialStatusResponse, DebugOptions, GetCredentialsResponse, HealthResponse, OAuthUrlResponse,
    OpenUrlRequest, OpenUrlResponse, StartAuthRequest, StartAuthResponse, TestAuthResponse,
    WaitingResponse,
};
use crate::{AppError, Result};

const URL_WAIT_TICK: Duration = Duration::from_millis(100);
const URL_FILE_INTERVAL: Duration = Duration::from_millis(250);
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);
const CLI_OUTPUT_EXCERPT: usize = 500;

const COMPLETION_PAGE: &str = "<!DOCTYPE html>
<html>
<head><title>Authentication Complete</title></head>
<body>
<h1>Authentication Complete</h1>
<p>You can close this window and return to the dashboard.</p>
<script>setTimeout(() => window.close(), 2000);</script>
</body>
</html>
";

/// Shared state behind the agent router.
#[derive(Debug)]
pub struct AgentState {
    config: Arc<AgentConfig>,
    sessions: AgentSessions,
    matcher: UrlMatcher,
    browser: BrowserDriver,
    http: reqwest::Client,
}

impl AgentState {
    /// Build agent state from configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the URL patterns or HTTP client cannot be built.
    pub fn new(config: AgentConfig) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(CALLBACK_TIMEOUT)
            .build()
            .map_err(|err| AppError::Config(format!("cannot build callback client: {err}")))?;
        Ok(Arc::new(Self {
            browser: BrowserDriver::new(config.browser.clone()),
            config: Arc::new(config),
            sessions: AgentSessions::new(),
            matcher: UrlMatcher::new()?,
            http,
        }))
    }

    /// Tracked sessions.
    #[must_use]
    pub fn sessions(&self) -> &AgentSessions {
        &self.sessions
    }

    /// Kill every tracked CLI. Returns how many sessions were dropped.
    pub async fn shutdown(&self) -> usize {
        self.sessions.kill_all().await
    }

    /// Start (or re-report) the login CLI for a session.
    async fn start_session(
        self: &Arc<Self>,
        provider: Provider,
        session_id: &str,
        debug: DebugOptions,
    ) -> Result<StartAuthResponse> {
        let url_file = url_file_path(&self.config.work_dir, session_id);
        let record = AgentSession::new(
            provider,
            provider.credential_path_in(&self.config.home_dir),
            url_file.clone(),
            self.config.transcript_limit,
        );
        if !self.sessions.insert_new(session_id, record).await {
            info!("start-auth repeated for a running session");
            return self.start_response(session_id).await;
        }

        if let Err(err) = self.launch(provider, session_id, url_file, debug).await {
            self.sessions.remove(session_id).await;
            return Err(err);
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.start_wait_ms);
        loop {
            let known = self
                .sessions
                .with(session_id, |s| s.oauth_url.is_some())
                .await
                .unwrap_or(false);
            if known || Instant::now() + URL_WAIT_TICK > deadline {
                break;
            }
            tokio::time::sleep(URL_WAIT_TICK).await;
        }
        self.start_response(session_id).await
    }

    async fn launch(
        self: &Arc<Self>,
        provider: Provider,
        session_id: &str,
        url_file: PathBuf,
        debug: DebugOptions,
    ) -> Result<()> {
        if let Err(err) = tokio::fs::remove_file(&url_file).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(%err, "stale url file not removed");
            }
        }
        let script = install_intercept_script(&self.config.work_dir).await?;

        if provider.needs_network_override() {
            apply_network_override(&self.config.network).await;
        }
        if !debug.skip_connectivity_checks {
            let summary = probe_connectivity(provider).await;
            self.sessions
                .with(session_id, |s| s.artifacts.connectivity = Some(summary))
                .await;
        }

        let config = Arc::clone(&self.config);
        let sid = session_id.to_owned();
        let SpawnedCli {
            handle,
            reader,
            child,
            strace_log,
        } = tokio::task::spawn_blocking(move || spawn_cli(&config, provider, &sid, &script, debug))
            .await
            .map_err(|err| AppError::Agent(format!("cli spawn task failed: {err}")))??;

        let writer = Arc::clone(&handle.writer);
        let mut handle = Some(handle);
        self.sessions
            .with(session_id, |s| {
                s.cli = handle.take();
                s.artifacts.strace_log = strace_log;
            })
            .await;
        if let Some(mut orphan) = handle {
            warn!("session vanished during spawn; killing cli");
            if let Err(err) = orphan.killer.kill() {
                debug!(%err, "orphan cli already exited");
            }
            return Err(AppError::NotFound(format!("session {session_id} was removed")));
        }

        self.pump_output(session_id, reader, child, writer)?;
        self.watch_url_file(session_id, url_file);
        Ok(())
    }

    fn pump_output(
        self: &Arc<Self>,
        session_id: &str,
        mut reader: Box<dyn Read + Send>,
        mut child: Box<dyn portable_pty::Child + Send + Sync>,
        writer: PtyWriter,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        let sid = session_id.to_owned();
        std::thread::Builder::new()
            .name(format!("cli-io-{sid}"))
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
                match child.wait() {
                    Ok(status) => info!(session_id = %sid, code = status.exit_code(), "cli exited"),
                    Err(err) => warn!(session_id = %sid, %err, "cli wait failed"),
                }
            })
            .map_err(|err| AppError::Agent(format!("failed to start cli reader: {err}")))?;

        let state = Arc::clone(self);
        let sid = session_id.to_owned();
        let span = info_span!("cli_output", session_id = %sid);
        tokio::spawn(
            async move {
                while let Some(chunk) = rx.recv().await {
                    state.handle_output(&sid, &chunk, &writer).await;
                }
                debug!("cli output closed");
            }
            .instrument(span),
        );
        Ok(())
    }

    async fn handle_output(self: &Arc<Self>, session_id: &str, chunk: &[u8], writer: &PtyWriter) {
        let text = String::from_utf8_lossy(chunk);
        let outcome = self
            .sessions
            .with(session_id, |s| {
                s.transcript.push(&text);
                let replies = s.automaton.feed(chunk);
                let url = if s.oauth_url.is_none() {
                    self.matcher.find(s.transcript.as_str())
                } else {
                    None
                };
                (replies, url)
            })
            .await;
        let Some((replies, url)) = outcome else {
            return;
        };

        if !replies.is_empty() {
            write_replies(writer, &replies);
        }
        if let Some(url) = url {
            self.record_url(session_id, url, "output").await;
        }
    }

    fn watch_url_file(self: &Arc<Self>, session_id: &str, url_file: PathBuf) {
        let state = Arc::clone(self);
        let sid = session_id.to_owned();
        let budget = Duration::from_millis(self.config.url_file_poll_ms);
        tokio::spawn(async move {
            if let Some(url) = poll_url_file(&url_file, budget, URL_FILE_INTERVAL).await {
                state.record_url(&sid, url, "side_channel").await;
            }
        });
    }

    /// Remember the first URL learned for a session and point the browser at it.
    async fn record_url(self: &Arc<Self>, session_id: &str, url: String, source: &'static str) {
        let launch = self
            .sessions
            .with(session_id, |s| {
                if s.oauth_url.is_some() {
                    return None;
                }
                s.oauth_url = Some(url.clone());
                let launch = s.browser == BrowserState::NotStarted;
                if launch {
                    s.browser = BrowserState::InProgress;
                }
                Some(launch)
            })
            .await
            .flatten();

        let Some(launch) = launch else {
            return;
        };
        info!(session_id, source, oauth_url = %url, "oauth url captured");
        if launch {
            let state = Arc::clone(self);
            let sid = session_id.to_owned();
            tokio::spawn(async move { state.drive_browser(&sid, &url).await });
        }
    }

    async fn drive_browser(&self, session_id: &str, url: &str) {
        let next = match self.browser.navigate(url).await {
            Ok(method) => {
                info!(session_id, method = method.as_str(), "browser pointed at oauth url");
                BrowserState::Launched
            }
            Err(err) => {
                warn!(session_id, %err, "browser navigation failed");
                BrowserState::NotStarted
            }
        };
        self.sessions.with(session_id, |s| s.browser = next).await;
    }

    async fn start_response(&self, session_id: &str) -> Result<StartAuthResponse> {
        self.sessions
            .with(session_id, |s| match &s.oauth_url {
                Some(url) => StartAuthResponse {
                    success: true,
                    message: "CLI OAuth server started".into(),
                    session_id: session_id.to_owned(),
                    oauth_url: Some(url.clone()),
                    cli_output: None,
                },
                None => StartAuthResponse {
                    success: true,
                    message: "CLI started, waiting for OAuth URL".into(),
                    session_id: session_id.to_owned(),
                    oauth_url: None,
                    cli_output: Some(s.transcript.excerpt(CLI_OUTPUT_EXCERPT)),
                },
            })
            .await
            .ok_or_else(|| session_not_found(session_id))
    }

    fn close_browser_later(&self) {
        let browser = self.browser.clone();
        tokio::spawn(async move { browser.close().await });
    }
}

fn write_replies(writer: &PtyWriter, replies: &[&str]) {
    let Ok(mut writer) = writer.lock() else {
        warn!("pty writer poisoned; prompt left unanswered");
        return;
    };
    for reply in replies {
        if let Err(err) = writer.write_all(reply.as_bytes()) {
            warn!(%err, "failed to answer prompt");
            return;
        }
        debug!(reply = ?reply, "prompt answered");
    }
    if let Err(err) = writer.flush() {
        warn!(%err, "failed to flush pty");
    }
}

fn session_not_found(session_id: &str) -> AppError {
    AppError::NotFound(format!("session {session_id} not found"))
}

/// `?sessionId=` query parameter.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    session_id: Option<String>,
}

impl SessionQuery {
    fn require(self) -> Result<String> {
        self.session_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AppError::Validation("sessionId is required".into()))
    }
}

async fn health(State(state): State<Arc<AgentState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        timestamp: Utc::now().to_rfc3339(),
        active_sessions: state.sessions.len().await,
    })
}

async fn start_auth(
    State(state): State<Arc<AgentState>>,
    Path(provider): Path<String>,
    payload: std::result::Result<Json<StartAuthRequest>, JsonRejection>,
) -> Result<Json<StartAuthResponse>> {
    let req = json_body(payload)?;
    if req.session_id.trim().is_empty() {
        return Err(AppError::Validation("sessionId is required".into()));
    }
    let provider: Provider = provider.parse()?;
    let span = info_span!("start_auth", session_id = %req.session_id, provider = %provider);
    let response = state
        .start_session(provider, &req.session_id, req.debug.unwrap_or_default())
        .instrument(span)
        .await?;
    Ok(Json(response))
}

async fn oauth_url(
    State(state): State<Arc<AgentState>>,
    Query(query): Query<SessionQuery>,
) -> Result<Response> {
    let session_id = query.require()?;
    let (url, elapsed_ms) = state
        .sessions
        .with(&session_id, |s| (s.oauth_url.clone(), s.elapsed_ms()))
        .await
        .ok_or_else(|| session_not_found(&session_id))?;

    Ok(match url {
        Some(oauth_url) => Json(OAuthUrlResponse { oauth_url }).into_response(),
        None => (
            StatusCode::ACCEPTED,
            Json(WaitingResponse {
                waiting: true,
                message: "Waiting for CLI to generate OAuth URL".into(),
                elapsed_ms,
            }),
        )
            .into_response(),
    })
}

async fn credential_status(
    State(state): State<Arc<AgentState>>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<CredentialStatusResponse>> {
    let session_id = query.require()?;
    let (cred_path, provider, elapsed_ms) = state
        .sessions
        .with(&session_id, |s| (s.cred_path.clone(), s.provider, s.elapsed_ms()))
        .await
        .ok_or_else(|| session_not_found(&session_id))?;

    let metadata = match tokio::fs::metadata(&cred_path).await {
        Ok(meta) if meta.is_file() => meta,
        _ => {
            return Ok(Json(CredentialStatusResponse {
                authenticated: false,
                waiting: Some(true),
                elapsed_ms: Some(elapsed_ms),
                ..CredentialStatusResponse::default()
            }));
        }
    };

    let first = state
        .sessions
        .with(&session_id, |s| !std::mem::replace(&mut s.completed, true))
        .await
        .unwrap_or(false);
    if first {
        info!(session_id, path = %cred_path.display(), "credential file detected");
        state.close_browser_later();
    }

    Ok(Json(CredentialStatusResponse {
        authenticated: true,
        path: Some(cred_path.display().to_string()),
        modified_at: metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339()),
        provider: Some(provider.as_str().to_owned()),
        ..CredentialStatusResponse::default()
    }))
}

async fn get_credentials(
    State(state): State<Arc<AgentState>>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<GetCredentialsResponse>> {
    let session_id = query.require()?;
    let (cred_path, provider, completed) = state
        .sessions
        .with(&session_id, |s| (s.cred_path.clone(), s.provider, s.completed))
        .await
        .ok_or_else(|| session_not_found(&session_id))?;
    if !completed {
        return Err(AppError::Validation("authentication not completed yet".into()));
    }

    let raw = tokio::fs::read_to_string(&cred_path)
        .await
        .map_err(|err| AppError::Io(format!("failed to read {}: {err}", cred_path.display())))?;
    let credentials: Value = serde_json::from_str(&raw)
        .map_err(|err| AppError::Io(format!("credential file is not valid JSON: {err}")))?;

    let mut session = state
        .sessions
        .remove(&session_id)
        .await
        .ok_or_else(|| session_not_found(&session_id))?;
    session.kill_cli();
    if let Err(err) = tokio::fs::remove_file(&session.url_file).await {
        debug!(%err, "url file not removed");
    }
    state.close_browser_later();
    info!(session_id, provider = %provider, "credentials handed over");

    Ok(Json(GetCredentialsResponse {
        success: true,
        provider: provider.as_str().to_owned(),
        credentials,
        cred_path: cred_path.display().to_string(),
    }))
}

async fn open_url(
    State(state): State<Arc<AgentState>>,
    payload: std::result::Result<Json<OpenUrlRequest>, JsonRejection>,
) -> Result<Json<OpenUrlResponse>> {
    let req = json_body(payload)?;
    if let Some(session_id) = req.session_id.as_deref() {
        state
            .sessions
            .with(session_id, |s| {
                s.oauth_url.get_or_insert_with(|| req.url.clone());
                s.browser = BrowserState::InProgress;
            })
            .await;
    }

    let result = state.browser.navigate(&req.url).await;
    if let Some(session_id) = req.session_id.as_deref() {
        let next = if result.is_ok() {
            BrowserState::Launched
        } else {
            BrowserState::NotStarted
        };
        state.sessions.with(session_id, |s| s.browser = next).await;
    }
    let method = result?;
    info!(method = method.as_str(), "explicit navigation");
    Ok(Json(OpenUrlResponse {
        success: true,
        method: method.as_str().to_owned(),
    }))
}

async fn auth_callback(State(state): State<Arc<AgentState>>, RawQuery(query): RawQuery) -> Response {
    let mut url = format!("http://127.0.0.1:{}/auth/callback", state.config.callback_port);
    if let Some(query) = query.as_deref().filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }

    let proxied = match state.http.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            let content_type = resp
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("text/html")
                .to_owned();
            resp.text().await.map(|body| (status, content_type, body))
        }
        Err(err) => Err(err),
    };

    match proxied {
        Ok((status, content_type, body)) => {
            info!(%status, "oauth callback proxied");
            ([(CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(err) => {
            warn!(%err, "oauth callback proxy failed; serving completion page");
            Html(COMPLETION_PAGE).into_response()
        }
    }
}

async fn test_auth(
    State(state): State<Arc<AgentState>>,
    Path(provider): Path<String>,
) -> Result<Json<TestAuthResponse>> {
    let provider: Provider = provider.parse()?;
    let path = provider.credential_path_in(&state.config.home_dir);
    let valid = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => serde_json::from_str::<Value>(&raw)
            .ok()
            .and_then(|v| v.as_object().map(|map| !map.is_empty()))
            .unwrap_or(false),
        Err(_) => false,
    };
    debug!(provider = %provider, valid, "credential self-test");
    Ok(Json(TestAuthResponse {
        valid,
        provider: provider.as_str().to_owned(),
    }))
}

async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type"));
    response
}

/// Build the agent router.
pub fn router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/callback", get(auth_callback))
        .route("/auth/{provider}", post(start_auth))
        .route("/oauth-url", get(oauth_url))
        .route("/credentials/status", get(credential_status))
        .route("/credentials/get", get(get_credentials))
        .route("/open-url", post(open_url))
        .route("/test-auth/{provider}", get(test_auth))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Serve the agent API until `ct` is cancelled, then kill every tracked CLI.
///
/// # Errors
///
/// Returns `AppError::Config` if the bind address is invalid, the listener
/// cannot bind, or the server fails.
pub async fn serve(state: Arc<AgentState>, ct: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.bind_address, state.config.port)
        .parse()
        .map_err(|err| AppError::Config(format!("invalid agent bind address: {err}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {addr}: {err}")))?;
    info!(%addr, "agent api listening");

    let served = axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Config(format!("agent server error: {err}")));

    let killed = state.shutdown().await;
    info!(killed, "agent stopped");
    served
}
