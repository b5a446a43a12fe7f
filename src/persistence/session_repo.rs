//! Session repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;

use crate::models::provider::Provider;
use crate::models::session::{Session, SessionStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_opt_ts, parse_ts, sortable_ts};

/// Fields written alongside a status transition. `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    /// Ephemeral VM bound to the session.
    pub ephemeral_vm_id: Option<String>,
    /// Address of the ephemeral VM.
    pub vm_ip: Option<String>,
    /// Remote-display URL.
    pub display_url: Option<String>,
    /// Captured OAuth URL.
    pub auth_url: Option<String>,
    /// Failure description.
    pub error_message: Option<String>,
}

impl SessionUpdate {
    /// Update carrying only an error message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    user_id: String,
    provider: String,
    status: String,
    ephemeral_vm_id: Option<String>,
    vm_ip: Option<String>,
    display_url: Option<String>,
    auth_url: Option<String>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
    timeout_at: Option<String>,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        let provider: Provider = self
            .provider
            .parse()
            .map_err(|_| AppError::Db(format!("invalid provider: {}", self.provider)))?;
        Ok(Session {
            id: self.id,
            user_id: self.user_id,
            provider,
            status: parse_status(&self.status)?,
            ephemeral_vm_id: self.ephemeral_vm_id,
            vm_ip: self.vm_ip,
            display_url: self.display_url,
            auth_url: self.auth_url,
            error_message: self.error_message,
            created_at: parse_ts("created_at", &self.created_at)?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
            timeout_at: parse_opt_ts("timeout_at", self.timeout_at.as_deref())?,
        })
    }
}

fn parse_status(s: &str) -> Result<SessionStatus> {
    match s {
        "started" => Ok(SessionStatus::Started),
        "vm_created" => Ok(SessionStatus::VmCreated),
        "ready" => Ok(SessionStatus::Ready),
        "awaiting_user_auth" => Ok(SessionStatus::AwaitingUserAuth),
        "completed" => Ok(SessionStatus::Completed),
        "failed" => Ok(SessionStatus::Failed),
        "timeout" => Ok(SessionStatus::Timeout),
        "cancelled" => Ok(SessionStatus::Cancelled),
        other => Err(AppError::Db(format!("invalid session status: {other}"))),
    }
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, session: &Session) -> Result<Session> {
        sqlx::query(
            "INSERT INTO auth_session (id, user_id, provider, status, ephemeral_vm_id, vm_ip,
             display_url, auth_url, error_message, created_at, updated_at, timeout_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(session.provider.as_str())
        .bind(session.status.as_str())
        .bind(&session.ephemeral_vm_id)
        .bind(&session.vm_ip)
        .bind(&session.display_url)
        .bind(&session.auth_url)
        .bind(&session.error_message)
        .bind(sortable_ts(session.created_at))
        .bind(sortable_ts(session.updated_at))
        .bind(session.timeout_at.map(|dt| dt.to_rfc3339()))
        .execute(self.db.as_ref())
        .await?;

        Ok(session.clone())
    }

    /// Retrieve a session by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM auth_session WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// Move a session to `status`, writing any fields carried by `update`.
    ///
    /// The write is conditional on the status read beforehand, so two
    /// concurrent transitions cannot both succeed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session,
    /// `AppError::Validation` if the transition is not permitted (including
    /// losing a race), or `AppError::Db` on persistence failure.
    pub async fn transition(
        &self,
        id: &str,
        status: SessionStatus,
        update: SessionUpdate,
    ) -> Result<Session> {
        let current = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))?;
        if !current.can_transition_to(status) {
            return Err(AppError::Validation(format!(
                "invalid session status transition {} -> {}",
                current.status.as_str(),
                status.as_str()
            )));
        }

        let now = sortable_ts(Utc::now());
        let result = sqlx::query(
            "UPDATE auth_session SET status = ?1,
                ephemeral_vm_id = COALESCE(?2, ephemeral_vm_id),
                vm_ip = COALESCE(?3, vm_ip),
                display_url = COALESCE(?4, display_url),
                auth_url = COALESCE(?5, auth_url),
                error_message = COALESCE(?6, error_message),
                updated_at = ?7
             WHERE id = ?8 AND status = ?9",
        )
        .bind(status.as_str())
        .bind(&update.ephemeral_vm_id)
        .bind(&update.vm_ip)
        .bind(&update.display_url)
        .bind(&update.auth_url)
        .bind(&update.error_message)
        .bind(&now)
        .bind(id)
        .bind(current.status.as_str())
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Validation(format!(
                "session {id} changed status concurrently"
            )));
        }

        self.get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))
    }

    /// Record the deadline of the login wait.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn set_timeout_at(&self, id: &str, timeout_at: chrono::DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE auth_session SET timeout_at = ?1 WHERE id = ?2")
            .bind(timeout_at.to_rfc3339())
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// List sessions that have not reached a terminal status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_non_terminal(&self) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT * FROM auth_session
             WHERE status IN ('started','vm_created','ready','awaiting_user_auth')
             ORDER BY created_at",
        )
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }
}
