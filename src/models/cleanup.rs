//! Durable VM teardown task model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Processing state of a cleanup task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStatus {
    /// Waiting for its due time.
    Pending,
    /// Claimed by the timer or the sweeper.
    Processing,
    /// VM destroyed and routing association removed.
    Completed,
    /// Teardown raised an error; the VM may still exist.
    Failed,
}

/// Scheduled destruction of an ephemeral VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupTask {
    /// Unique task identifier.
    pub id: String,
    /// VM to destroy.
    pub vm_id: String,
    /// Session the VM was bound to.
    pub session_id: String,
    /// Earliest time the VM may be destroyed.
    pub due_at: DateTime<Utc>,
    /// Processing state.
    pub status: CleanupStatus,
    /// Failure description when `status` is `Failed`.
    pub error: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl CleanupTask {
    /// Construct a pending task due at `due_at`.
    #[must_use]
    pub fn new(vm_id: String, session_id: String, due_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            vm_id,
            session_id,
            due_at,
            status: CleanupStatus::Pending,
            error: None,
            created_at: Utc::now(),
        }
    }
}
