//! Orchestrator HTTP API.
//!
//! Consumed by the dashboard: it starts sessions, polls their status,
//! relays URL traffic to the session's agent, and manages stored
//! credentials.

pub mod error;
pub mod routes;

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{AppError, Result};

pub use routes::ApiState;

/// Build the orchestrator router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/auth/start", post(routes::start))
        .route("/api/auth/rotate", post(routes::rotate))
        .route("/api/auth/session/{session_id}", get(routes::session_status))
        .route("/api/auth/session/{session_id}/cancel", post(routes::cancel))
        .route("/api/auth/session/{session_id}/oauth-url", get(routes::oauth_url))
        .route("/api/auth/session/{session_id}/open-url", post(routes::open_url))
        .route(
            "/api/auth/session/{session_id}/display-handshake",
            get(routes::display_handshake),
        )
        .route("/api/auth/credentials/{user_id}", get(routes::list_credentials))
        .route("/api/auth/validate/{user_id}/{provider}", get(routes::validate))
        .with_state(state)
}

/// Serve the orchestrator API on `port` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the listener cannot bind or the server fails.
pub async fn serve(state: ApiState, port: u16, ct: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {addr}: {err}")))?;
    info!(%addr, "orchestrator api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Config(format!("api server error: {err}")))?;
    Ok(())
}
