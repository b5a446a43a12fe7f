//! Local browser navigation on the VM's X display.

use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::{AppError, Result};

/// How a navigation request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigateMethod {
    /// An existing window was focused and pointed at the URL.
    Reused,
    /// A new browser process was started.
    Launched,
    /// Browser automation is switched off.
    Disabled,
}

impl NavigateMethod {
    /// Wire name used in `POST /open-url` responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reused => "reused",
            Self::Launched => "launched",
            Self::Disabled => "disabled",
        }
    }
}

/// Drives the VM's browser through `xdotool` and process launch.
#[derive(Debug, Clone)]
pub struct BrowserDriver {
    config: BrowserConfig,
}

impl BrowserDriver {
    /// Create a driver for the configured browser.
    #[must_use]
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.env("DISPLAY", &self.config.display)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(xauthority) = &self.config.xauthority {
            cmd.env("XAUTHORITY", xauthority);
        }
        cmd
    }

    async fn xdotool(&self, args: &[&str]) -> bool {
        match self.command(&self.config.xdotool).args(args).status().await {
            Ok(status) => status.success(),
            Err(err) => {
                debug!(%err, "xdotool unavailable");
                false
            }
        }
    }

    /// Show `url`: reuse a running window when possible, otherwise launch fresh.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Agent` if the browser cannot be launched.
    pub async fn navigate(&self, url: &str) -> Result<NavigateMethod> {
        if !self.config.enabled {
            return Ok(NavigateMethod::Disabled);
        }
        if self.try_reuse(url).await {
            info!("browser window reused");
            return Ok(NavigateMethod::Reused);
        }
        drop(self.launch(url).await?);
        Ok(NavigateMethod::Launched)
    }

    async fn try_reuse(&self, url: &str) -> bool {
        let output = self
            .command(&self.config.xdotool)
            .args(["search", "--onlyvisible", "--class", self.config.binary.as_str()])
            .stdout(Stdio::piped())
            .output()
            .await;
        let Ok(output) = output else {
            return false;
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(window) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
            return false;
        };

        self.xdotool(&["windowactivate", "--sync", window]).await
            && self.xdotool(&["key", "--clearmodifiers", "ctrl+l"]).await
            && self.xdotool(&["type", "--delay", "10", url]).await
            && self.xdotool(&["key", "Return"]).await
    }

    /// Start a fresh browser on `url`. The returned task completes once the process exits.
    async fn launch(&self, url: &str) -> Result<JoinHandle<()>> {
        self.close().await;

        let mut args = vec![
            "--no-first-run".to_owned(),
            "--no-default-browser-check".to_owned(),
            format!("--user-data-dir={}", self.config.profile_dir.display()),
        ];
        if let Some(proxy) = &self.config.proxy {
            args.push(format!("--proxy-server={proxy}"));
        }
        args.push(url.to_owned());

        let child = self
            .command(&self.config.binary)
            .args(&args)
            .spawn()
            .map_err(|err| AppError::Agent(format!("failed to launch {}: {err}", self.config.binary)))?;
        info!(pid = ?child.id(), proxy = self.config.proxy.is_some(), "browser launched");
        Ok(reap(child))
    }

    /// Terminate any running browser instance. Best-effort.
    pub async fn close(&self) {
        if !self.config.enabled {
            return;
        }
        match self.command("pkill").args(["-f", self.config.binary.as_str()]).status().await {
            Ok(status) if status.success() => debug!("stale browser terminated"),
            Ok(_) => {}
            Err(err) => warn!(%err, "pkill unavailable"),
        }
    }
}

/// Wait on `child` in the background so its exit status is collected.
fn reap(mut child: Child) -> JoinHandle<()> {
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!(%status, "browser exited"),
            Err(err) => warn!(%err, "browser exit status unavailable"),
        }
    })
}
