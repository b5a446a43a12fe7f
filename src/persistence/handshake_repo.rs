//! Pre-negotiated remote-display handshakes, keyed by session.

use std::sync::Arc;

use chrono::Utc;

use crate::Result;

use super::db::Database;

/// Repository for display handshake payloads.
#[derive(Clone)]
pub struct HandshakeRepo {
    db: Arc<Database>,
}

impl HandshakeRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store (or replace) the handshake for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn put(&self, session_id: &str, payload: &serde_json::Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO display_handshake (session_id, payload, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE SET payload = excluded.payload",
        )
        .bind(session_id)
        .bind(sqlx::types::Json(payload))
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Fetch the handshake for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, session_id: &str) -> Result<Option<serde_json::Value>> {
        let row: Option<(sqlx::types::Json<serde_json::Value>,)> =
            sqlx::query_as("SELECT payload FROM display_handshake WHERE session_id = ?1")
                .bind(session_id)
                .fetch_optional(self.db.as_ref())
                .await?;
        Ok(row.map(|(json,)| json.0))
    }
}
