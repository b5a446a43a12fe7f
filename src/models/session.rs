//! Authentication session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::provider::Provider;

/// Lifecycle status for an authentication session.
///
/// The non-terminal variants are declared in forward order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session persisted; no VM exists yet.
    Started,
    /// Ephemeral VM created and bound to the session.
    VmCreated,
    /// In-VM agent answered its health check.
    Ready,
    /// OAuth URL surfaced; waiting for the human to log in.
    AwaitingUserAuth,
    /// Credentials stored and transferred to the worker VM.
    Completed,
    /// Fatal provisioning, agent, storage, or transfer error.
    Failed,
    /// The user did not finish the login within the budget.
    Timeout,
    /// Cancelled by the user.
    Cancelled,
}

impl SessionStatus {
    /// Whether no further transition is permitted.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    /// Position in the forward ordering; terminal failures share the last rank.
    fn rank(self) -> u8 {
        match self {
            Self::Started => 0,
            Self::VmCreated => 1,
            Self::Ready => 2,
            Self::AwaitingUserAuth => 3,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled => 4,
        }
    }

    /// Wire and storage name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::VmCreated => "vm_created",
            Self::Ready => "ready",
            Self::AwaitingUserAuth => "awaiting_user_auth",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Authentication session persisted in `SQLite`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Unique session identifier.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// CLI provider being authenticated.
    pub provider: Provider,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Ephemeral browser VM bound to this session.
    pub ephemeral_vm_id: Option<String>,
    /// Address of the ephemeral VM.
    pub vm_ip: Option<String>,
    /// Externally reachable remote-display URL.
    pub display_url: Option<String>,
    /// OAuth URL captured by the agent.
    pub auth_url: Option<String>,
    /// Failure description for terminal failure states.
    pub error_message: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Deadline after which the login wait is abandoned.
    pub timeout_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Construct a new session in `started` with a generated identifier.
    #[must_use]
    pub fn new(user_id: String, provider: Provider) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            provider,
            status: SessionStatus::Started,
            ephemeral_vm_id: None,
            vm_ip: None,
            display_url: None,
            auth_url: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            timeout_at: None,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// Transitions only move forward (phases may be skipped) and terminal
    /// states never change again.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        next.rank() > self.status.rank()
    }
}
