//! In-memory records of login sessions running inside this VM.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use portable_pty::{ChildKiller, MasterPty};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::automaton::PromptAutomaton;
use crate::models::provider::Provider;

/// Progress of driving the local browser to the OAuth URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserState {
    /// Nothing launched yet.
    NotStarted,
    /// A launch or window reuse is running.
    InProgress,
    /// The browser shows the URL.
    Launched,
}

/// Files produced by diagnostic switches.
#[derive(Debug, Clone, Default)]
pub struct DebugArtifacts {
    /// `strace -f` output file.
    pub strace_log: Option<PathBuf>,
    /// Result of the outbound connectivity probe.
    pub connectivity: Option<String>,
}

/// Bounded record of CLI output; the oldest bytes are dropped first.
#[derive(Debug, Clone)]
pub struct Transcript {
    buf: String,
    limit: usize,
}

impl Transcript {
    /// Empty transcript keeping at most `limit` bytes.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit: limit.max(1),
        }
    }

    /// Append output.
    pub fn push(&mut self, text: &str) {
        self.buf.push_str(text);
        if self.buf.len() > self.limit {
            let mut cut = self.buf.len() - self.limit;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
    }

    /// Retained output.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.buf
    }

    /// Last `max` characters with terminal escapes removed.
    #[must_use]
    pub fn excerpt(&self, max: usize) -> String {
        let clean = strip_ansi_escapes::strip(self.buf.as_bytes());
        let clean = String::from_utf8_lossy(&clean);
        let skip = clean.chars().count().saturating_sub(max);
        clean.chars().skip(skip).collect()
    }
}

/// Writable end of a CLI's pseudo-terminal.
pub type PtyWriter = Arc<StdMutex<Box<dyn Write + Send>>>;

/// Handles to a spawned CLI process.
pub struct CliHandle {
    /// Terminates the CLI.
    pub killer: Box<dyn ChildKiller + Send + Sync>,
    /// Terminal input.
    pub writer: PtyWriter,
    /// Controlling side of the terminal, held so it outlives the CLI.
    pub master: Box<dyn MasterPty + Send>,
}

impl std::fmt::Debug for CliHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliHandle").finish_non_exhaustive()
    }
}

/// State of one login session.
#[derive(Debug)]
pub struct AgentSession {
    /// Provider whose CLI runs.
    pub provider: Provider,
    /// When `start-auth` first accepted the session.
    pub started: Instant,
    /// Where the CLI writes its credential file.
    pub cred_path: PathBuf,
    /// Side-channel file the interception script appends URLs to.
    pub url_file: PathBuf,
    /// OAuth URL, once learned.
    pub oauth_url: Option<String>,
    /// Set when the credential file has been observed.
    pub completed: bool,
    /// Browser navigation progress.
    pub browser: BrowserState,
    /// Prompt answering state.
    pub automaton: PromptAutomaton,
    /// Recent CLI output.
    pub transcript: Transcript,
    /// Diagnostic outputs.
    pub artifacts: DebugArtifacts,
    /// Running CLI, once spawned.
    pub cli: Option<CliHandle>,
}

impl AgentSession {
    /// Fresh record for a session that has not spawned its CLI yet.
    #[must_use]
    pub fn new(provider: Provider, cred_path: PathBuf, url_file: PathBuf, transcript_limit: usize) -> Self {
        Self {
            provider,
            started: Instant::now(),
            cred_path,
            url_file,
            oauth_url: None,
            completed: false,
            browser: BrowserState::NotStarted,
            automaton: PromptAutomaton::for_provider(provider),
            transcript: Transcript::new(transcript_limit),
            artifacts: DebugArtifacts::default(),
            cli: None,
        }
    }

    /// Milliseconds since the session was accepted.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Terminate the CLI, if it is still tracked.
    pub fn kill_cli(&mut self) {
        if let Some(mut cli) = self.cli.take() {
            if let Err(err) = cli.killer.kill() {
                debug!(%err, "cli already exited");
            }
        }
    }
}

/// All sessions known to this agent, keyed by orchestrator session id.
#[derive(Debug, Default)]
pub struct AgentSessions {
    inner: Mutex<HashMap<String, AgentSession>>,
}

impl AgentSessions {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked sessions.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Whether no session is tracked.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Insert `session` unless the id is already tracked. Returns whether it was inserted.
    pub async fn insert_new(&self, session_id: &str, session: AgentSession) -> bool {
        let mut sessions = self.inner.lock().await;
        if sessions.contains_key(session_id) {
            return false;
        }
        sessions.insert(session_id.to_owned(), session);
        true
    }

    /// Run `f` against a session, if tracked.
    pub async fn with<R>(&self, session_id: &str, f: impl FnOnce(&mut AgentSession) -> R) -> Option<R> {
        self.inner.lock().await.get_mut(session_id).map(f)
    }

    /// Stop tracking a session.
    pub async fn remove(&self, session_id: &str) -> Option<AgentSession> {
        self.inner.lock().await.remove(session_id)
    }

    /// Kill every tracked CLI and forget all sessions.
    pub async fn kill_all(&self) -> usize {
        let drained: Vec<(String, AgentSession)> = self.inner.lock().await.drain().collect();
        let count = drained.len();
        for (session_id, mut session) in drained {
            if session.cli.is_some() {
                warn!(session_id, "killing cli on shutdown");
            }
            session.kill_cli();
        }
        count
    }
}
