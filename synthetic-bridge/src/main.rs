//! Synthetic Bridge - command line entry point
//!
//! Loads the configuration, installs logging and runs the fleet until Ctrl-C.
//! The first Ctrl-C stops every station and persists the pool, a second one exits at once.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use synthetic_bridge::services::http::http_services;
use synthetic_bridge::{BridgeConfig, FleetManager, RunOptions};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "synthetic-bridge")]
#[command(about = "Simulated sensor station fleet for measurement collection services")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config_file", default_value = "config/config.toml")]
    config_file: PathBuf,

    /// Discard the stored station pool before starting
    #[arg(short, long)]
    reset: bool,

    /// Deregister and delete every pooled station
    #[arg(short, long)]
    delete: bool,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C ({}), running until every station terminates", e);
        std::future::pending::<()>().await;
    }
    info!("Ctrl-C received, stopping stations (press again to exit immediately)");
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second Ctrl-C, exiting without saving");
            std::process::exit(130);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = BridgeConfig::load(&cli.config_file)
        .await
        .with_context(|| format!("Failed to load configuration from {}", cli.config_file.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🛰️ Synthetic bridge starting with {}", cli.config_file.display());

    let services = http_services().context("Failed to set up HTTP client")?;
    let options = RunOptions {
        reset: cli.reset,
        delete: cli.delete,
    };

    let summary = FleetManager::new(config, services)
        .run(options, shutdown_signal())
        .await
        .context("Fleet run failed")?;

    info!(
        "Done: {} active, {} failed, {} deleted ({} forced), {} stopped early",
        summary.active, summary.failed, summary.deleted, summary.forced_deletions, summary.stopped
    );
    Ok(())
}
