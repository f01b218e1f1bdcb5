//! # ferrite update agent
//!
//! The update agent runs on each edge device and keeps its system
//! image in sync with the deployment server. It polls for assigned
//! deployments, streams the artifact onto the inactive partition,
//! reboots into the new image, and commits or rolls back depending on
//! what actually booted. Progress is reported back to the server at
//! every step and survives power loss through an on-disk checkpoint.
//!
//! ## Usage
//! ```bash
//! ferrite-agent --config /etc/ferrite/ferrite.yaml
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod agent;
mod cli;
mod config;
mod controller;
mod daemon;
mod deployment_log;
mod device;
mod error;
mod server;
mod state;
mod store;

use cli::Args;
use config::Config;

/// Config location probed when `--config` is not given.
const DEFAULT_CONFIG_PATH: &str = "/etc/ferrite/ferrite.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.log_json {
        ferrite_common::init_logging_json(&args.log_level)?;
    } else {
        ferrite_common::init_logging(&args.log_level)?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting ferrite update agent"
    );

    let config = match &args.config {
        Some(config_path) => {
            // Explicit config file provided
            match Config::load(config_path) {
                Ok(cfg) => {
                    info!(config_path = %config_path, "Configuration loaded");
                    cfg.with_cli_overrides(&args)
                }
                Err(err) => {
                    error!(error = %err, path = %config_path, "Failed to load configuration");
                    return Err(err);
                }
            }
        }
        None => {
            // Try the default location, fall back to CLI-only config
            match Config::load(DEFAULT_CONFIG_PATH) {
                Ok(cfg) => {
                    info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                    cfg.with_cli_overrides(&args)
                }
                Err(_) => {
                    info!("No config file found, using CLI arguments and defaults");
                    Config::default_with_cli(&args)
                }
            }
        }
    };

    info!(
        server = %config.server.url,
        backend = ?config.device.backend,
        "Update agent configured"
    );

    if let Err(err) = daemon::run(config).await {
        error!(error = %err, "Update agent failed");
        return Err(err);
    }

    Ok(())
}
