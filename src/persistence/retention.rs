//! Retention service for time-based data purge.
//!
//! Runs as a background task deleting finished cleanup tasks, then
//! display handshakes and terminal sessions older than `retention_days`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::db::Database;
use super::sortable_ts;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task.
///
/// The task runs hourly.
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
                    if let Err(err) = purge(&db, cutoff).await {
                        error!(?err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Delete finished records last touched before `cutoff`.
///
/// # Errors
///
/// Returns `AppError::Db` if any delete fails.
pub async fn purge(db: &Database, cutoff: DateTime<Utc>) -> Result<()> {
    let cutoff_str = sortable_ts(cutoff);

    let tasks = sqlx::query(
        "DELETE FROM vm_cleanup_task
         WHERE status IN ('completed','failed') AND created_at < ?1",
    )
    .bind(&cutoff_str)
    .execute(db)
    .await?
    .rows_affected();

    sqlx::query(
        "DELETE FROM display_handshake WHERE session_id IN
         (SELECT id FROM auth_session
          WHERE status IN ('completed','failed','timeout','cancelled') AND updated_at < ?1)",
    )
    .bind(&cutoff_str)
    .execute(db)
    .await?;

    let sessions = sqlx::query(
        "DELETE FROM auth_session
         WHERE status IN ('completed','failed','timeout','cancelled') AND updated_at < ?1",
    )
    .bind(&cutoff_str)
    .execute(db)
    .await?
    .rows_affected();

    info!(tasks, sessions, "retention purge completed");
    Ok(())
}
