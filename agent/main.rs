#![forbid(unsafe_code)]

//! `authbridge-agent`: in-VM OAuth agent binary.
//!
//! Serves the agent API on the VM's network interface and kills every
//! tracked CLI on shutdown.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use authbridge::agent::{self, AgentState};
use authbridge::config::AgentConfig;
use authbridge::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "authbridge-agent", about = "In-VM OAuth agent", version, long_about = None)]
struct Cli {
    /// Optional TOML configuration file; defaults apply without one.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    install_panic_hook();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = AgentConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }
    info!(port = config.port, home = %config.home_dir.display(), "agent starting");

    let state = AgentState::new(config)?;
    let ct = CancellationToken::new();

    let serve_ct = ct.clone();
    let server = tokio::spawn(agent::serve(state, serve_ct));

    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(%err, "agent api failed"),
        Err(err) => error!(%err, "agent api task panicked"),
    }
    Ok(())
}

/// Log panics through tracing; a panicking handler must not go unnoticed.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        error!(%location, panic = %info, "panic in agent");
    }));
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
