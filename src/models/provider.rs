//! Supported CLI providers and their fixed in-guest conventions.
//!
//! [`Provider::credential_relpath`] is the single table both the in-VM agent
//! (to detect a finished login) and the credential transfer step (to place
//! the file in the worker VM) read from.

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::CliCommand;
use crate::AppError;

/// Home directory of the account the CLIs run as inside every VM.
pub const GUEST_HOME: &str = "/root";

/// CLI coding assistant whose login this system automates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// `OpenAI` Codex CLI.
    Codex,
    /// Anthropic Claude Code CLI.
    ClaudeCode,
    /// Google Gemini CLI.
    GeminiCli,
}

/// How the agent attaches a terminal to the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMode {
    /// The CLI only blocks on cursor-position queries; answer them and nothing else.
    CursorResponder,
    /// The CLI presents interactive prompts that must be answered.
    Interactive,
}

impl Provider {
    /// All providers in a stable order.
    pub const ALL: [Self; 3] = [Self::Codex, Self::ClaudeCode, Self::GeminiCli];

    /// Wire name used in URLs, JSON, and storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::ClaudeCode => "claude_code",
            Self::GeminiCli => "gemini_cli",
        }
    }

    /// Credential file location relative to the guest home directory.
    #[must_use]
    pub fn credential_relpath(self) -> &'static str {
        match self {
            Self::Codex => ".codex/auth.json",
            Self::ClaudeCode => ".claude/.credentials.json",
            Self::GeminiCli => ".gemini/oauth_creds.json",
        }
    }

    /// Credential file path under an arbitrary home directory.
    #[must_use]
    pub fn credential_path_in(self, home: &Path) -> PathBuf {
        home.join(self.credential_relpath())
    }

    /// Absolute in-guest credential file path.
    #[must_use]
    pub fn guest_credential_path(self) -> PathBuf {
        self.credential_path_in(Path::new(GUEST_HOME))
    }

    /// Default CLI invocation that starts the login flow.
    #[must_use]
    pub fn default_cli(self) -> CliCommand {
        let (program, args): (&str, &[&str]) = match self {
            Self::Codex => ("codex", &["login"]),
            Self::ClaudeCode => ("claude", &[]),
            Self::GeminiCli => ("gemini", &[]),
        };
        CliCommand {
            program: program.into(),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
        }
    }

    /// Terminal attachment style for this provider's CLI.
    #[must_use]
    pub fn terminal_mode(self) -> TerminalMode {
        match self {
            Self::Codex => TerminalMode::CursorResponder,
            Self::ClaudeCode | Self::GeminiCli => TerminalMode::Interactive,
        }
    }

    /// Whether the DNS and default-route workaround must run before spawn.
    #[must_use]
    pub fn needs_network_override(self) -> bool {
        matches!(self, Self::GeminiCli)
    }

    /// Authorization host used for connectivity diagnostics.
    #[must_use]
    pub fn auth_host(self) -> &'static str {
        match self {
            Self::Codex => "auth.openai.com",
            Self::ClaudeCode => "claude.ai",
            Self::GeminiCli => "accounts.google.com",
        }
    }
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "codex" => Ok(Self::Codex),
            "claude_code" => Ok(Self::ClaudeCode),
            "gemini_cli" => Ok(Self::GeminiCli),
            other => Err(AppError::Validation(format!("unknown provider: {other}"))),
        }
    }
}
