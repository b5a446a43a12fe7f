//! Configuration parsing, validation, and master-key loading.
//!
//! Two configurations live here: [`GlobalConfig`] for the orchestrator
//! process and [`AgentConfig`] for the in-VM agent. Every timing value is
//! expressed in milliseconds so tests can shrink the bounded waits.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::models::provider::Provider;
use crate::{AppError, Result};

/// Keyring service name used for secrets owned by this application.
pub const KEYRING_SERVICE: &str = "authbridge";

/// Length, in hex characters, of a valid AES-256 master key.
const MASTER_KEY_HEX_LEN: usize = 64;

/// Connection details for the external VM management service.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct VmProviderConfig {
    /// Base URL of the VM management REST API.
    pub base_url: String,
    /// Per-request timeout.
    #[serde(default = "default_provider_request_ms")]
    pub request_timeout_ms: u64,
}

fn default_provider_request_ms() -> u64 {
    60_000
}

/// Bounded-wait budgets for the provisioning and OAuth pipeline.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Delay before the first readiness probe.
    #[serde(default = "default_warmup_ms")]
    pub health_warmup_ms: u64,
    /// Interval between readiness probes.
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    /// Overall readiness budget measured after warm-up.
    #[serde(default = "default_health_budget_ms")]
    pub health_budget_ms: u64,
    /// Timeout for a single readiness probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub health_probe_timeout_ms: u64,
    /// Timeout for agent RPCs (start-auth, credentials/get, validation probes).
    #[serde(default = "default_agent_request_ms")]
    pub agent_request_ms: u64,
    /// Interval between credential-status polls.
    #[serde(default = "default_oauth_poll_ms")]
    pub oauth_poll_interval_ms: u64,
    /// Wall-clock budget for the user to finish the provider login.
    #[serde(default = "default_oauth_budget_ms")]
    pub oauth_budget_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            health_warmup_ms: default_warmup_ms(),
            health_interval_ms: default_health_interval_ms(),
            health_budget_ms: default_health_budget_ms(),
            health_probe_timeout_ms: default_probe_timeout_ms(),
            agent_request_ms: default_agent_request_ms(),
            oauth_poll_interval_ms: default_oauth_poll_ms(),
            oauth_budget_ms: default_oauth_budget_ms(),
        }
    }
}

fn default_warmup_ms() -> u64 {
    45_000
}

fn default_health_interval_ms() -> u64 {
    2_000
}

fn default_health_budget_ms() -> u64 {
    120_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_agent_request_ms() -> u64 {
    10_000
}

fn default_oauth_poll_ms() -> u64 {
    2_000
}

fn default_oauth_budget_ms() -> u64 {
    300_000
}

/// Ephemeral VM teardown scheduling.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CleanupConfig {
    /// Grace period before destroying the VM of a completed session.
    #[serde(default = "default_grace_ms")]
    pub completed_grace_ms: u64,
    /// Grace period before destroying the VM of a failed, timed-out, or cancelled session.
    #[serde(default = "default_grace_ms")]
    pub failed_grace_ms: u64,
    /// How often the durable sweeper looks for due tasks.
    #[serde(default = "default_sweep_ms")]
    pub sweep_interval_ms: u64,
    /// Days after which finished cleanup tasks and terminal sessions are purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            completed_grace_ms: default_grace_ms(),
            failed_grace_ms: default_grace_ms(),
            sweep_interval_ms: default_sweep_ms(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_grace_ms() -> u64 {
    1_800_000
}

fn default_sweep_ms() -> u64 {
    5_000
}

fn default_retention_days() -> u32 {
    30
}

/// Diagnostic switches forwarded to the pipeline and the agent.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DebugConfig {
    /// Leave the ephemeral VM running when a session does not complete.
    #[serde(default)]
    pub keep_failed_vms: bool,
    /// Ask the agent to run the CLI under `strace`.
    #[serde(default)]
    pub run_strace: bool,
    /// Ask the agent to skip its outbound connectivity diagnostics.
    #[serde(default)]
    pub skip_connectivity_checks: bool,
}

impl DebugConfig {
    /// Whether any diagnostic flag needs forwarding to the agent.
    #[must_use]
    pub fn forwards_to_agent(&self) -> bool {
        self.run_strace || self.skip_connectivity_checks
    }
}

fn default_http_port() -> u16 {
    4000
}

fn default_agent_port() -> u16 {
    8080
}

fn default_public_base_url() -> String {
    "http://localhost:4000".into()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("authbridge.db")
}

fn default_users_dir() -> PathBuf {
    PathBuf::from("/var/lib/authbridge/users")
}

fn default_mount_root() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_true() -> bool {
    true
}

/// Orchestrator configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// HTTP port for the orchestrator API.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Externally reachable base URL of this orchestrator.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// `SQLite` database file.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Port the in-VM agent listens on.
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    /// Remote-display URL template; see [`crate::orchestrator::display`].
    #[serde(default)]
    pub display_url_template: Option<String>,
    /// Directory holding one `{vm_id}/rootfs.ext4` per VM.
    #[serde(default = "default_users_dir")]
    pub users_dir: PathBuf,
    /// Parent directory for transient loop-mount points.
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,
    /// Probe the worker VM when validating stored credentials.
    #[serde(default = "default_true")]
    pub validate_probe: bool,
    /// External VM management service.
    pub vm_provider: VmProviderConfig,
    /// Bounded-wait budgets.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Teardown scheduling.
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Diagnostic switches.
    #[serde(default)]
    pub debug: DebugConfig,
    /// Hex-encoded AES-256 master key (populated at runtime).
    #[serde(skip)]
    pub master_key: String,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the credential master key from OS keychain with env-var fallback.
    ///
    /// Tries the `authbridge` keyring service first, then falls back to the
    /// `AUTHBRIDGE_MASTER_KEY` environment variable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no key is found or it is not 64 hex characters.
    pub async fn load_master_key(&mut self) -> Result<()> {
        let key = load_credential("master_key", "AUTHBRIDGE_MASTER_KEY").await?;
        validate_master_key(&key)?;
        self.master_key = key;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.vm_provider.base_url.trim().is_empty() {
            return Err(AppError::Config("vm_provider.base_url must not be empty".into()));
        }

        let t = &self.timeouts;
        if t.health_interval_ms == 0 || t.oauth_poll_interval_ms == 0 {
            return Err(AppError::Config("poll intervals must be greater than zero".into()));
        }
        if t.health_budget_ms < t.health_interval_ms {
            return Err(AppError::Config(
                "health_budget_ms must be at least health_interval_ms".into(),
            ));
        }
        if t.oauth_budget_ms < t.oauth_poll_interval_ms {
            return Err(AppError::Config(
                "oauth_budget_ms must be at least oauth_poll_interval_ms".into(),
            ));
        }
        if self.cleanup.sweep_interval_ms == 0 {
            return Err(AppError::Config(
                "cleanup.sweep_interval_ms must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

/// Check that a master key is 64 hex characters.
///
/// # Errors
///
/// Returns `AppError::Config` describing the defect.
pub fn validate_master_key(key: &str) -> Result<()> {
    if key.len() != MASTER_KEY_HEX_LEN || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AppError::Config(format!(
            "master key must be {MASTER_KEY_HEX_LEN} hex characters"
        )));
    }
    Ok(())
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env::var(env_key).map_err(|_| {
        AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))
    })
}

// ── Agent configuration ──────────────────────────────────────────────────────

/// Browser automation settings for the in-VM agent.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct BrowserConfig {
    /// Whether the agent drives a local browser at all.
    pub enabled: bool,
    /// Browser executable.
    pub binary: String,
    /// Window-automation executable used to reuse a running browser.
    pub xdotool: String,
    /// Profile directory passed as `--user-data-dir`.
    pub profile_dir: PathBuf,
    /// Optional outbound proxy passed as `--proxy-server`.
    pub proxy: Option<String>,
    /// X display the browser renders on.
    pub display: String,
    /// X authority file for the display.
    pub xauthority: Option<PathBuf>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: "chromium".into(),
            xdotool: "xdotool".into(),
            profile_dir: PathBuf::from("/tmp/authbridge-browser"),
            proxy: None,
            display: ":1".into(),
            xauthority: None,
        }
    }
}

/// Connectivity workaround applied before spawning providers that need it.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct NetworkConfig {
    /// Nameserver written to `resolv_conf` for affected providers.
    pub nameserver: String,
    /// Resolver file to overwrite.
    pub resolv_conf: PathBuf,
    /// Default gateway installed for affected providers, if any.
    pub default_gateway: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            nameserver: "8.8.8.8".into(),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            default_gateway: None,
        }
    }
}

/// Command override for a provider's CLI.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CliCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
}

/// In-VM agent configuration. Every field has a default, so the file is optional.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct AgentConfig {
    /// Address the control API binds to.
    pub bind_address: String,
    /// Port the control API listens on.
    pub port: u16,
    /// Home directory the CLIs write their credential files under.
    pub home_dir: PathBuf,
    /// Directory for side-channel URL files, interception scripts, and debug artifacts.
    pub work_dir: PathBuf,
    /// Port of the CLI's own local OAuth callback listener.
    pub callback_port: u16,
    /// Synchronous window `start-auth` waits for a URL before answering.
    pub start_wait_ms: u64,
    /// How long the side-channel file is polled after spawn.
    pub url_file_poll_ms: u64,
    /// Maximum bytes of CLI output retained per session.
    pub transcript_limit: usize,
    /// Browser automation.
    pub browser: BrowserConfig,
    /// Connectivity workaround.
    pub network: NetworkConfig,
    /// Per-provider CLI command overrides keyed by provider name.
    pub cli: HashMap<String, CliCommand>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: default_agent_port(),
            home_dir: PathBuf::from("/root"),
            work_dir: PathBuf::from("/tmp/authbridge"),
            callback_port: 1455,
            start_wait_ms: 2_000,
            url_file_poll_ms: 10_000,
            transcript_limit: 64 * 1024,
            browser: BrowserConfig::default(),
            network: NetworkConfig::default(),
            cli: HashMap::new(),
        }
    }
}

impl AgentConfig {
    /// Load the agent configuration, or defaults when no path is given.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
                Self::from_toml_str(&raw)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse agent configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing fails or an override names an unknown provider.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        for name in config.cli.keys() {
            name.parse::<Provider>()
                .map_err(|_| AppError::Config(format!("unknown provider in [cli]: {name}")))?;
        }
        Ok(config)
    }

    /// CLI invocation for a provider, honouring overrides.
    #[must_use]
    pub fn cli_command(&self, provider: Provider) -> CliCommand {
        self.cli
            .get(provider.as_str())
            .cloned()
            .unwrap_or_else(|| provider.default_cli())
    }
}
