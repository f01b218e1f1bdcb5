//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

/// ferrite update agent - OTA system updates for edge devices
#[derive(Parser, Debug)]
#[command(name = "ferrite-agent")]
#[command(about = "ferrite update agent - OTA system updates for edge devices")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON (for log aggregation)
    #[arg(long)]
    pub log_json: bool,

    /// Deployment server base URL
    #[arg(long)]
    pub server: Option<String>,

    /// Seconds between deployment checks
    #[arg(long)]
    pub update_poll_interval: Option<u64>,

    /// Directory holding the persistent agent state
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Enable development mode (in-memory state, mock device)
    #[arg(long)]
    pub dev: bool,
}
