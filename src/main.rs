//! CLI entry point for the telemetry gateway.
//!
//! # Usage
//!
//! Run with the default configuration file (`config/gateway.toml`, optional):
//! ```bash
//! telemetry_gateway
//! ```
//!
//! Run with an explicit file and JSON logs:
//! ```bash
//! telemetry_gateway --config /etc/gateway.toml --log-format json run
//! ```
//!
//! Validate a configuration and print the effective values:
//! ```bash
//! telemetry_gateway --config /etc/gateway.toml check-config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use telemetry_gateway::config::GatewayConfig;
use telemetry_gateway::logging::{self, OutputFormat, TracingConfig};
use telemetry_gateway::Gateway;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "telemetry_gateway")]
#[command(about = "Vehicle telemetry acquisition and TCP fan-out", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/gateway.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log format
    #[arg(long, global = true, value_enum)]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway and run until Ctrl+C
    Run,

    /// Load and validate the configuration, then print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = GatewayConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("failed to load configuration from {}", path.display()),
        None => "failed to load configuration".to_string(),
    })?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, cli.log_format).await,
        Commands::CheckConfig => {
            let rendered = serde_json::to_string_pretty(&config)?;
            println!("{rendered}");
            Ok(())
        }
    }
}

async fn run(config: GatewayConfig, log_format: Option<OutputFormat>) -> Result<()> {
    let mut tracing_config = TracingConfig::from_config(&config).map_err(anyhow::Error::msg)?;
    if let Some(format) = log_format {
        tracing_config = tracing_config.with_format(format);
    }
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        can = config.can.enabled,
        imu = config.imu.enabled,
        gnss = config.gnss.enabled,
        "telemetry gateway starting"
    );

    let gateway = Gateway::start(config)
        .await
        .context("gateway failed to start")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("interrupt received");

    if let Err(e) = gateway.shutdown().await {
        error!(error = %e, "shutdown incomplete");
        return Err(e.into());
    }
    Ok(())
}
