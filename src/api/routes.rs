//! Orchestrator route handlers.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::json_body;
use crate::models::provider::Provider;
use crate::models::session::Session;
use crate::orchestrator::AuthService;
use crate::Result;

/// Shared handler state.
pub type ApiState = Arc<AuthService>;

/// `POST /api/auth/start` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Owning user.
    pub user_id: String,
    /// Provider wire name.
    pub provider: String,
    /// Pre-negotiated remote-display handshake.
    #[serde(default, alias = "webrtcOffer")]
    pub display_handshake: Option<Value>,
}

/// `POST /api/auth/rotate` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateRequest {
    /// Owning user.
    pub user_id: String,
    /// Provider wire name.
    pub provider: String,
}

/// `POST /api/auth/session/{id}/open-url` body.
#[derive(Debug, Deserialize)]
pub struct OpenUrlBody {
    /// URL to open in the session's browser.
    pub url: String,
}

/// Answer to a start or rotate request.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartResponse {
    /// Always `true`; failures use the error body.
    pub success: bool,
    /// New session identifier.
    #[serde(rename = "sessionId")]
    pub session_id: String,
    /// Provider wire name.
    pub provider: String,
    /// Remote-display URL; unknown until a VM exists.
    #[serde(rename = "novncURL")]
    pub novnc_url: Option<String>,
    /// VM address; unknown until a VM exists.
    #[serde(rename = "browserIP")]
    pub browser_ip: Option<String>,
}

impl From<&Session> for StartResponse {
    fn from(session: &Session) -> Self {
        Self {
            success: true,
            session_id: session.id.clone(),
            provider: session.provider.as_str().to_owned(),
            novnc_url: None,
            browser_ip: None,
        }
    }
}

pub(super) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": Utc::now().to_rfc3339() }))
}

pub(super) async fn start(
    State(service): State<ApiState>,
    payload: std::result::Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<StartResponse>> {
    let req = json_body(payload)?;
    let provider: Provider = req.provider.parse()?;
    let session = service
        .start_authentication(&req.user_id, provider, req.display_handshake)
        .await?;
    Ok(Json(StartResponse::from(&session)))
}

pub(super) async fn session_status(
    State(service): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>> {
    Ok(Json(service.get_session_status(&session_id).await?))
}

pub(super) async fn cancel(
    State(service): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>> {
    let session = service.cancel_session(&session_id).await?;
    Ok(Json(json!({
        "success": true,
        "sessionId": session.id,
        "status": session.status,
    })))
}

pub(super) async fn oauth_url(
    State(service): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Response> {
    let (status, value) = service.relay_oauth_url(&session_id).await?;
    Ok(relay(status, value))
}

pub(super) async fn open_url(
    State(service): State<ApiState>,
    Path(session_id): Path<String>,
    payload: std::result::Result<Json<OpenUrlBody>, JsonRejection>,
) -> Result<Response> {
    let req = json_body(payload)?;
    let (status, value) = service.relay_open_url(&session_id, &req.url).await?;
    Ok(relay(status, value))
}

fn relay(status: reqwest::StatusCode, value: Value) -> Response {
    let status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(value)).into_response()
}

pub(super) async fn display_handshake(
    State(service): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>> {
    Ok(Json(service.display_handshake(&session_id).await?))
}

pub(super) async fn rotate(
    State(service): State<ApiState>,
    payload: std::result::Result<Json<RotateRequest>, JsonRejection>,
) -> Result<Json<StartResponse>> {
    let req = json_body(payload)?;
    let provider: Provider = req.provider.parse()?;
    let session = service.rotate_credentials(&req.user_id, provider).await?;
    Ok(Json(StartResponse::from(&session)))
}

pub(super) async fn list_credentials(
    State(service): State<ApiState>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>> {
    let credentials = service.list_credentials(&user_id).await?;
    Ok(Json(json!({ "success": true, "credentials": credentials })))
}

pub(super) async fn validate(
    State(service): State<ApiState>,
    Path((user_id, provider)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let report = service.validate_credentials(&user_id, &provider).await?;
    let mut value = serde_json::to_value(&report)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("provider".into(), Value::String(provider));
    }
    Ok(Json(value))
}
