//! guardraild — the Guardrail daemon.
//!
//! Single binary that assembles the controller:
//! - Config (TOML, hot-reloaded)
//! - State store (redb, optional)
//! - File-spool collaborators (samples, traffic, pressure, applied limits)
//! - Reconciler, circuit breakers, emergency controller
//! - `/metrics` + operator API
//!
//! # Usage
//!
//! ```text
//! guardraild run --config guardrail.toml --spool /var/spool/guardrail --data-dir /var/lib/guardrail
//! guardraild check-config --config guardrail.toml
//! ```

mod http;
mod reload;
mod spool;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use guardrail_core::{ConfigHandle, GuardrailConfig, TracingSink};
use guardrail_reconcile::{Guardrail, GuardrailParts};
use guardrail_state::StateStore;

use crate::reload::ConfigReloader;
use crate::spool::FileSpool;

#[derive(Parser)]
#[command(name = "guardraild", about = "Adaptive limit controller for multi-tenant metrics backends")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller until interrupted.
    Run {
        /// Configuration file.
        #[arg(long)]
        config: PathBuf,

        /// Spool directory shared with the collectors and the patcher.
        #[arg(long)]
        spool: PathBuf,

        /// Data directory for persistent state. State is kept in memory when
        /// omitted.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Address for `/metrics` and the operator API.
        #[arg(long, default_value = "0.0.0.0:9464")]
        listen: SocketAddr,

        /// How often the config file is checked for changes, in seconds.
        #[arg(long, default_value = "10")]
        reload_interval: u64,

        /// Emit logs as JSON.
        #[arg(long)]
        log_json: bool,
    },
    /// Validate a configuration file and exit.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_json = matches!(cli.command, Command::Run { log_json: true, .. });
    init_tracing(log_json);

    match cli.command {
        Command::Run {
            config,
            spool,
            data_dir,
            listen,
            reload_interval,
            ..
        } => run(config, spool, data_dir, listen, Duration::from_secs(reload_interval)).await,
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,guardraild=debug,guardrail=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = GuardrailConfig::from_file(path)?;
    println!(
        "{}: ok (mode {:?}, {} limits, {} tiers, {} tenant overrides)",
        path.display(),
        config.mode,
        config.limits.len(),
        config.tiers.len(),
        config.overrides.len()
    );
    Ok(())
}

async fn run(
    config_path: PathBuf,
    spool_dir: PathBuf,
    data_dir: Option<PathBuf>,
    listen: SocketAddr,
    reload_interval: Duration,
) -> anyhow::Result<()> {
    info!("guardrail daemon starting");

    // ── Configuration ──────────────────────────────────────────

    let config = GuardrailConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(
        path = %config_path.display(),
        mode = ?config.mode,
        limits = config.limits.len(),
        "configuration loaded"
    );
    let config = ConfigHandle::new(config);

    // ── State store ────────────────────────────────────────────

    let store = match &data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let db_path = dir.join("guardrail.redb");
            let store = StateStore::open(&db_path)?;
            info!(path = ?db_path, "state store opened");
            Some(store)
        }
        None => {
            info!("no data directory, state is not persisted");
            None
        }
    };

    // ── Controller ─────────────────────────────────────────────

    std::fs::create_dir_all(&spool_dir)?;
    let spool = Arc::new(FileSpool::new(&spool_dir));
    let sink = Arc::new(TracingSink);
    let guardrail = Arc::new(Guardrail::new(GuardrailParts {
        config: config.clone(),
        collector: spool.clone(),
        patcher: spool.clone(),
        pressure: spool.clone(),
        traffic: spool,
        audit: sink.clone(),
        alerts: sink.clone(),
        store,
    }));
    guardrail.restore().await?;
    info!(spool = %spool_dir.display(), "controller initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let controller_handle = tokio::spawn(guardrail.clone().run(shutdown_rx.clone()));

    let reloader = ConfigReloader::new(&config_path, config, sink);
    let reload_handle = tokio::spawn(reloader.run(reload_interval, shutdown_rx));

    // ── Start HTTP server ──────────────────────────────────────

    let router = http::build_router(guardrail);
    info!(%listen, "HTTP server starting");
    let listener = tokio::net::TcpListener::bind(listen).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = controller_handle.await;
    let _ = reload_handle.await;

    info!("guardrail daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../guardrail.example.toml");
        check_config(&path).unwrap();
        let config = GuardrailConfig::from_file(&path).unwrap();
        assert!(config.tier_for("acme").is_some());
        assert!(config.manual_override("beta", "query_sharding_enabled").is_some());
    }

    #[test]
    fn cli_parses_run() {
        let cli = Cli::try_parse_from([
            "guardraild",
            "run",
            "--config",
            "guardrail.toml",
            "--spool",
            "/tmp/spool",
            "--log-json",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                data_dir,
                listen,
                log_json,
                ..
            } => {
                assert!(data_dir.is_none());
                assert_eq!(listen.port(), 9464);
                assert!(log_json);
            }
            Command::CheckConfig { .. } => panic!("expected run"),
        }
    }
}
