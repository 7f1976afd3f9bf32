//! `camera-monitord`: run the hybrid camera monitor as a daemon.
//!
//! Loads configuration, initializes tracing, starts the monitor, and runs
//! until SIGINT. On shutdown the monitor drains within the configured stop
//! deadline and the final statistics snapshot is logged.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::info;

use camera_monitor::{config::MonitorConfig, monitor::HybridCameraMonitor, telemetry};

#[derive(Parser, Debug)]
#[command(name = "camera-monitord", about = "Hybrid camera discovery and capability monitor")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config/monitor.toml")]
    config: PathBuf,

    /// Override the configured log format (pretty, compact, json).
    #[arg(long)]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = MonitorConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load configuration from {:?}", cli.config))?;
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }
    config.validate().map_err(|reason| anyhow!(reason))?;

    telemetry::init_from_config(&config).map_err(|reason| anyhow!(reason))?;
    info!(config_path = ?cli.config, "configuration loaded");

    let stop_timeout = config.stop_timeout;
    let monitor = HybridCameraMonitor::new(config);
    monitor.start().await?;

    if monitor.wait_until_ready().await {
        let connected = monitor.connected_cameras().await;
        info!(cameras = connected.len(), "initial discovery complete");
    } else {
        info!("initial discovery still in progress, continuing");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    monitor.stop(stop_timeout).await?;
    let stats = monitor.stats();
    info!(
        polling_cycles = stats.polling_cycles,
        state_changes = stats.device_state_changes,
        probes_attempted = stats.probes_attempted,
        probes_successful = stats.probes_successful,
        "monitor stopped"
    );
    Ok(())
}
