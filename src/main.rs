#![forbid(unsafe_code)]

//! `authbridge`: session orchestrator binary.
//!
//! Bootstraps configuration and the credential master key, opens the
//! database, recovers state left by a previous process, starts the cleanup
//! sweeper and retention task, and serves the orchestrator HTTP API.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use authbridge::api;
use authbridge::config::GlobalConfig;
use authbridge::credentials::transfer::LoopMounter;
use authbridge::orchestrator::vm_provider::HttpVmProvider;
use authbridge::orchestrator::AuthService;
use authbridge::persistence::{db, retention};
use authbridge::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "authbridge", about = "VM-isolated OAuth login orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the HTTP port from the configuration file.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("authbridge orchestrator bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    config.load_master_key().await?;
    let config = Arc::new(config);
    info!("configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.database_path).await?);
    info!(path = %config.database_path.display(), "database connected");

    // ── Build the service ───────────────────────────────
    let ct = CancellationToken::new();
    let vms = Arc::new(HttpVmProvider::new(&config.vm_provider)?);
    let service = AuthService::new(
        Arc::clone(&config),
        Arc::clone(&db),
        vms,
        Arc::new(LoopMounter),
        ct.clone(),
    )?;

    // ── Recover state from a previous process ───────────
    match service.recover_on_startup().await {
        Ok(count) if count > 0 => info!(count, "interrupted sessions failed on startup"),
        Ok(_) => {}
        Err(err) => error!(%err, "startup recovery failed"),
    }

    // ── Background services ─────────────────────────────
    let sweeper_handle = service
        .cleanup()
        .spawn_sweeper(Duration::from_millis(config.cleanup.sweep_interval_ms));
    let retention_handle =
        retention::spawn_retention_task(Arc::clone(&db), config.cleanup.retention_days, ct.clone());
    info!("cleanup sweeper and retention service started");

    // ── Serve the API ───────────────────────────────────
    let api_ct = ct.clone();
    let api_state = Arc::clone(&service);
    let port = config.http_port;
    let api_handle = tokio::spawn(async move {
        if let Err(err) = api::serve(api_state, port, api_ct).await {
            error!(%err, "orchestrator api failed");
        }
    });

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let _ = tokio::join!(api_handle, sweeper_handle, retention_handle);
    info!("authbridge shut down");
    Ok(())
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
