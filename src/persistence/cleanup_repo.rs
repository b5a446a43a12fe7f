//! Durable VM cleanup task repository.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::cleanup::{CleanupStatus, CleanupTask};
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_ts, sortable_ts};

/// Repository wrapper around `SQLite` for cleanup tasks.
#[derive(Clone)]
pub struct CleanupRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct CleanupRow {
    id: String,
    vm_id: String,
    session_id: String,
    due_at: String,
    status: String,
    error: Option<String>,
    created_at: String,
}

impl CleanupRow {
    fn into_task(self) -> Result<CleanupTask> {
        Ok(CleanupTask {
            id: self.id,
            vm_id: self.vm_id,
            session_id: self.session_id,
            due_at: parse_ts("due_at", &self.due_at)?,
            status: parse_cleanup_status(&self.status)?,
            error: self.error,
            created_at: parse_ts("created_at", &self.created_at)?,
        })
    }
}

fn parse_cleanup_status(s: &str) -> Result<CleanupStatus> {
    match s {
        "pending" => Ok(CleanupStatus::Pending),
        "processing" => Ok(CleanupStatus::Processing),
        "completed" => Ok(CleanupStatus::Completed),
        "failed" => Ok(CleanupStatus::Failed),
        other => Err(AppError::Db(format!("invalid cleanup status: {other}"))),
    }
}

fn cleanup_status_str(s: CleanupStatus) -> &'static str {
    match s {
        CleanupStatus::Pending => "pending",
        CleanupStatus::Processing => "processing",
        CleanupStatus::Completed => "completed",
        CleanupStatus::Failed => "failed",
    }
}

impl CleanupRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a cleanup task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, task: &CleanupTask) -> Result<CleanupTask> {
        sqlx::query(
            "INSERT INTO vm_cleanup_task (id, vm_id, session_id, due_at, status, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&task.id)
        .bind(&task.vm_id)
        .bind(&task.session_id)
        .bind(sortable_ts(task.due_at))
        .bind(cleanup_status_str(task.status))
        .bind(&task.error)
        .bind(sortable_ts(task.created_at))
        .execute(self.db.as_ref())
        .await?;

        Ok(task.clone())
    }

    /// Retrieve a task by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<CleanupTask>> {
        let row: Option<CleanupRow> = sqlx::query_as("SELECT * FROM vm_cleanup_task WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(CleanupRow::into_task).transpose()
    }

    /// Pending tasks whose due time is at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<CleanupTask>> {
        let rows: Vec<CleanupRow> = sqlx::query_as(
            "SELECT * FROM vm_cleanup_task
             WHERE status = 'pending' AND due_at <= ?1
             ORDER BY due_at",
        )
        .bind(sortable_ts(now))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(CleanupRow::into_task).collect()
    }

    /// Atomically move a task from `pending` to `processing`.
    ///
    /// Returns `false` when another worker already claimed it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn claim(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE vm_cleanup_task SET status = 'processing' WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record the final outcome of a claimed task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn finish(&self, id: &str, status: CleanupStatus, error: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE vm_cleanup_task SET status = ?1, error = ?2 WHERE id = ?3")
            .bind(cleanup_status_str(status))
            .bind(error)
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Return tasks stranded in `processing` by a crashed process to `pending`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn requeue_processing(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE vm_cleanup_task SET status = 'pending' WHERE status = 'processing'",
        )
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }
}
