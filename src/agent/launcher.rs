//! CLI process launch inside the VM.
//!
//! Every CLI runs on a pseudo-terminal. `BROWSER` points at an
//! interception script so the CLI's own "open a browser" call only
//! records the URL; the agent decides when the real browser opens.

use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{info, warn};

use super::registry::CliHandle;
use crate::config::{AgentConfig, NetworkConfig};
use crate::models::provider::Provider;
use crate::protocol::DebugOptions;
use crate::{AppError, Result};

/// Environment variable naming the side-channel file.
pub const URL_FILE_ENV: &str = "AUTHBRIDGE_URL_FILE";

const INTERCEPT_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$1\" >> \"$AUTHBRIDGE_URL_FILE\"\n";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Wide enough that authorization URLs are never wrapped.
const PTY_SIZE: PtySize = PtySize {
    rows: 50,
    cols: 512,
    pixel_width: 0,
    pixel_height: 0,
};

/// A CLI running on a pseudo-terminal.
pub struct SpawnedCli {
    /// Kill switch and terminal input.
    pub handle: CliHandle,
    /// Terminal output.
    pub reader: Box<dyn Read + Send>,
    /// Child process, reaped by whoever drains `reader`.
    pub child: Box<dyn portable_pty::Child + Send + Sync>,
    /// `strace` output file when tracing was requested.
    pub strace_log: Option<PathBuf>,
}

/// Side-channel file for a session.
#[must_use]
pub fn url_file_path(work_dir: &Path, session_id: &str) -> PathBuf {
    work_dir.join(format!("oauth-url-{session_id}.txt"))
}

/// Write the `BROWSER` interception script into `work_dir`.
///
/// # Errors
///
/// Returns `AppError::Io` if the directory or script cannot be written.
pub async fn install_intercept_script(work_dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(work_dir).await?;
    let script = work_dir.join("browser-intercept.sh");
    tokio::fs::write(&script, INTERCEPT_SCRIPT).await?;
    tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(script)
}

/// Point DNS at a public resolver and optionally replace the default route.
///
/// Failures are logged; the CLI is spawned regardless.
pub async fn apply_network_override(network: &NetworkConfig) {
    let resolv = format!("nameserver {}\n", network.nameserver);
    match tokio::fs::write(&network.resolv_conf, resolv).await {
        Ok(()) => info!(nameserver = %network.nameserver, "resolver overridden"),
        Err(err) => warn!(%err, path = %network.resolv_conf.display(), "resolver override failed"),
    }

    let Some(gateway) = network.default_gateway.as_deref() else {
        return;
    };
    let status = Command::new("ip")
        .args(["route", "replace", "default", "via", gateway])
        .kill_on_drop(true)
        .status()
        .await;
    match status {
        Ok(status) if status.success() => info!(gateway, "default route replaced"),
        Ok(status) => warn!(gateway, code = ?status.code(), "default route override failed"),
        Err(err) => warn!(gateway, %err, "default route override failed"),
    }
}

/// TCP probe to the provider's authorization host.
pub async fn probe_connectivity(provider: Provider) -> String {
    let host = provider.auth_host();
    let result = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, 443))).await;
    let summary = match result {
        Ok(Ok(_)) => format!("{host}:443 reachable"),
        Ok(Err(err)) => format!("{host}:443 unreachable: {err}"),
        Err(_) => format!("{host}:443 timed out"),
    };
    info!(provider = %provider, connectivity = %summary, "connectivity probe");
    summary
}

/// Spawn the provider's login CLI on a fresh pseudo-terminal.
///
/// Blocking; call from `spawn_blocking`.
///
/// # Errors
///
/// Returns `AppError::Agent` if the terminal cannot be opened or the CLI fails to start.
pub fn spawn_cli(
    config: &AgentConfig,
    provider: Provider,
    session_id: &str,
    intercept_script: &Path,
    debug: DebugOptions,
) -> Result<SpawnedCli> {
    let cli = config.cli_command(provider);
    let url_file = url_file_path(&config.work_dir, session_id);

    let strace_log = debug
        .run_strace
        .then(|| config.work_dir.join(format!("strace-{session_id}.log")));
    let mut cmd = match &strace_log {
        Some(log) => {
            let mut cmd = CommandBuilder::new("strace");
            cmd.arg("-f");
            cmd.arg("-o");
            cmd.arg(log);
            cmd.arg(&cli.program);
            cmd
        }
        None => CommandBuilder::new(&cli.program),
    };
    for arg in &cli.args {
        cmd.arg(arg);
    }
    cmd.cwd(&config.home_dir);
    cmd.env("HOME", &config.home_dir);
    cmd.env("TERM", "xterm-256color");
    cmd.env("BROWSER", intercept_script);
    cmd.env(URL_FILE_ENV, &url_file);
    cmd.env("DISPLAY", &config.browser.display);
    if let Some(xauthority) = &config.browser.xauthority {
        cmd.env("XAUTHORITY", xauthority);
    }

    let pair = native_pty_system()
        .openpty(PTY_SIZE)
        .map_err(|err| AppError::Agent(format!("failed to open pty: {err}")))?;
    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|err| AppError::Agent(format!("failed to spawn {}: {err}", cli.program)))?;
    drop(pair.slave);

    let killer = child.clone_killer();
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|err| AppError::Agent(format!("failed to clone pty reader: {err}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|err| AppError::Agent(format!("failed to take pty writer: {err}")))?;

    info!(
        provider = %provider,
        program = %cli.program,
        pid = ?child.process_id(),
        strace = strace_log.is_some(),
        "cli spawned"
    );

    Ok(SpawnedCli {
        handle: CliHandle {
            killer,
            writer: Arc::new(StdMutex::new(writer)),
            master: pair.master,
        },
        reader,
        child,
        strace_log,
    })
}
