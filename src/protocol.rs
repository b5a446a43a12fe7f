//! JSON bodies exchanged between the orchestrator and the in-VM agent.
//!
//! Field names are part of the wire contract; both the agent server and
//! the orchestrator's client serialize through these types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `GET /health` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: String,
    /// RFC 3339 time of the response.
    pub timestamp: String,
    /// Sessions currently tracked by the agent.
    pub active_sessions: usize,
}

/// Diagnostic switches accepted by `POST /auth/{provider}`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DebugOptions {
    /// Run the CLI under `strace -f`.
    #[serde(default)]
    pub run_strace: bool,
    /// Skip outbound connectivity diagnostics.
    #[serde(default)]
    pub skip_connectivity_checks: bool,
}

/// `POST /auth/{provider}` request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartAuthRequest {
    /// Orchestrator session identifier.
    pub session_id: String,
    /// Optional diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugOptions>,
}

/// `POST /auth/{provider}` response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartAuthResponse {
    /// Whether the CLI is running.
    pub success: bool,
    /// Human-readable progress message.
    pub message: String,
    /// Echo of the session identifier.
    pub session_id: String,
    /// OAuth URL, when captured within the synchronous window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_url: Option<String>,
    /// Bounded raw CLI output, when no URL is known yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_output: Option<String>,
}

/// `GET /oauth-url` 200 body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OAuthUrlResponse {
    /// Captured OAuth URL.
    pub oauth_url: String,
}

/// `GET /oauth-url` 202 body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WaitingResponse {
    /// Always `true`.
    pub waiting: bool,
    /// Human-readable progress message.
    pub message: String,
    /// Milliseconds since the session started.
    pub elapsed_ms: u64,
}

/// `GET /credentials/status` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatusResponse {
    /// Whether the credential file exists.
    pub authenticated: bool,
    /// Credential file path, once authenticated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// RFC 3339 modification time of the credential file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
    /// Provider name, once authenticated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// `true` while still waiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting: Option<bool>,
    /// Milliseconds since the session started, while waiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

/// `GET /credentials/get` 200 body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GetCredentialsResponse {
    /// Whether the payload was read.
    pub success: bool,
    /// Provider name.
    pub provider: String,
    /// Parsed credential file.
    pub credentials: Value,
    /// Path the file was read from.
    pub cred_path: String,
}

/// `POST /open-url` request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpenUrlRequest {
    /// URL to navigate to.
    pub url: String,
    /// Session whose browser state to update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// `POST /open-url` response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpenUrlResponse {
    /// Whether navigation was triggered.
    pub success: bool,
    /// `"reused"` or `"launched"`.
    pub method: String,
}

/// `GET /test-auth/{provider}` response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TestAuthResponse {
    /// Whether a usable credential file is installed.
    pub valid: bool,
    /// Provider name.
    pub provider: String,
}

/// Error body used by every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Description of the failure.
    pub error: String,
}
