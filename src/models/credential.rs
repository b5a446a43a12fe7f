//! Stored credential records and the logical slots they occupy.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::provider::Provider;
use crate::AppError;

/// Logical storage slot for a credential.
///
/// Claude Code credentials fan out into tier slots depending on the
/// subscription advertised in the payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSlot {
    /// Base slot of a provider.
    Base(Provider),
    /// Claude Code on the Pro tier.
    ClaudeCodePro,
    /// Claude Code on the Max tier (a superset of Pro).
    ClaudeCodeMax,
}

impl CredentialSlot {
    /// Storage name of the slot.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Base(provider) => provider.as_str(),
            Self::ClaudeCodePro => "claude_code_pro",
            Self::ClaudeCodeMax => "claude_code_max",
        }
    }

    /// Provider whose CLI consumes this slot.
    #[must_use]
    pub fn provider(self) -> Provider {
        match self {
            Self::Base(provider) => provider,
            Self::ClaudeCodePro | Self::ClaudeCodeMax => Provider::ClaudeCode,
        }
    }
}

impl Display for CredentialSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialSlot {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude_code_pro" => Ok(Self::ClaudeCodePro),
            "claude_code_max" => Ok(Self::ClaudeCodeMax),
            other => other.parse::<Provider>().map(Self::Base),
        }
    }
}

/// Encrypted credential persisted in `SQLite`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredential {
    /// Unique record identifier.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Logical slot; unique per user.
    pub slot: CredentialSlot,
    /// Hex of `nonce || ciphertext || tag`.
    pub ciphertext: String,
    /// Hex of the per-record key-derivation salt.
    pub salt: String,
    /// Result of the most recent validation.
    pub is_valid: bool,
    /// When the credential was last validated.
    pub last_verified: Option<DateTime<Utc>>,
    /// Expiry advertised by the payload, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Listing view of a stored credential; carries no secret material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialSummary {
    /// Record identifier.
    pub credential_id: String,
    /// Slot name.
    pub provider: String,
    /// Result of the most recent validation.
    pub is_valid: bool,
    /// When the credential was last validated.
    pub last_verified: Option<DateTime<Utc>>,
    /// Advertised expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&StoredCredential> for CredentialSummary {
    fn from(cred: &StoredCredential) -> Self {
        Self {
            credential_id: cred.id.clone(),
            provider: cred.slot.as_str().to_owned(),
            is_valid: cred.is_valid,
            last_verified: cred.last_verified,
            expires_at: cred.expires_at,
        }
    }
}

/// Outcome of validating a stored credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// Whether the credential is believed usable.
    pub valid: bool,
    /// True when no live probe could be made.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub untested: bool,
    /// Machine-readable reason when invalid or untested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ValidationReport {
    /// Valid after a successful probe.
    #[must_use]
    pub fn valid() -> Self {
        Self {
            valid: true,
            untested: false,
            reason: None,
        }
    }

    /// Presumed valid; no probe possible.
    #[must_use]
    pub fn untested(reason: &str) -> Self {
        Self {
            valid: true,
            untested: true,
            reason: Some(reason.to_owned()),
        }
    }

    /// Invalid for the given reason.
    #[must_use]
    pub fn invalid(reason: &str) -> Self {
        Self {
            valid: false,
            untested: false,
            reason: Some(reason.to_owned()),
        }
    }
}
