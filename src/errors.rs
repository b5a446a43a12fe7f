//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// VM could not be created, resumed, or health-gated. Fatal for the session.
    Provisioning(String),
    /// Transient network failure talking to a VM, the VM provider, or an agent.
    NetworkTransient(String),
    /// A bounded wait exceeded its budget.
    Timeout(String),
    /// Malformed or semantically invalid request.
    Validation(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Mounting, writing, or unmounting the worker VM image failed.
    CredentialTransfer(String),
    /// Encrypting or decrypting a credential blob failed.
    Encryption(String),
    /// The in-VM agent answered with an unexpected or unsuccessful payload.
    Agent(String),
    /// File-system or process I/O failure.
    Io(String),
}

impl AppError {
    /// Whether this error should surface as the distinct `timeout` session status.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Provisioning(msg) => write!(f, "provisioning: {msg}"),
            Self::NetworkTransient(msg) => write!(f, "network: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::CredentialTransfer(msg) => write!(f, "credential transfer: {msg}"),
            Self::Encryption(msg) => write!(f, "encryption: {msg}"),
            Self::Agent(msg) => write!(f, "agent: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::NetworkTransient(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("invalid json: {err}"))
    }
}
