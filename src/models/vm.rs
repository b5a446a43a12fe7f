//! VM descriptors returned by the VM provider.

use serde::{Deserialize, Serialize};

/// Role a VM plays for a user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VmKind {
    /// Durable per-user VM where the CLI runs after login.
    Worker,
    /// Short-lived desktop VM that hosts one login session.
    Browser,
}

/// Power state reported for a VM.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    /// Booted and reachable.
    Running,
    /// Suspended; must be resumed before use.
    Hibernated,
    /// Powered off.
    Stopped,
    /// Any state this crate does not act on.
    #[serde(other)]
    Unknown,
}

/// A VM identity plus its address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmHandle {
    /// Provider-assigned identifier.
    pub vm_id: String,
    /// Guest IP address.
    pub ip_address: String,
    /// Power state, when the provider reports one.
    #[serde(default = "default_state")]
    pub status: VmState,
}

fn default_state() -> VmState {
    VmState::Running
}

impl VmHandle {
    /// Whether the VM must be resumed before use.
    #[must_use]
    pub fn needs_resume(&self) -> bool {
        self.status != VmState::Running
    }
}
