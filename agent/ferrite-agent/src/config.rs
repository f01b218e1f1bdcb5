//! Configuration management for the update agent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::cli::Args;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Deployment server connection
    pub server: ServerConfig,
    /// Poll cadence
    pub polling: PollingConfig,
    /// On-device directory layout
    pub paths: PathsConfig,
    /// Device backend and helper commands
    pub device: DeviceConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref server) = args.server {
            self.server.url = server.clone();
        }

        if let Some(interval) = args.update_poll_interval {
            self.polling.update_poll_interval_secs = interval;
        }

        if let Some(ref state_dir) = args.state_dir {
            self.paths.state_dir = state_dir.clone();
            self.paths.deployment_log_dir = state_dir.join("deployment-logs");
        }

        if args.dev {
            self.device.backend = DeviceBackend::Mock;
        }

        self
    }

    /// Create a default config (used when no config file is found).
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }

    /// The device type this agent reports, from the config or the
    /// data-directory marker file.
    pub fn device_type(&self) -> String {
        if let Some(ref device_type) = self.device.device_type {
            return device_type.clone();
        }

        let marker = self.paths.data_dir.join("device_type");
        match std::fs::read_to_string(&marker) {
            Ok(content) => content
                .lines()
                .find_map(|line| line.trim().strip_prefix("device_type=").map(str::to_string))
                .unwrap_or_else(|| {
                    warn!(path = %marker.display(), "Device type marker has no device_type entry");
                    "unknown".to_string()
                }),
            Err(err) => {
                warn!(error = %err, path = %marker.display(), "Failed to read the device type marker");
                "unknown".to_string()
            }
        }
    }
}

/// Deployment server connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the deployment server
    pub url: String,
    /// Tenant token sent with authorization requests (hosted setups)
    pub tenant_token: Option<String>,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "https://updates.ferrite.example".to_string(),
            tenant_token: None,
            request_timeout_secs: 300,
            connect_timeout_secs: 30,
        }
    }
}

/// Poll cadence configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Seconds between deployment checks
    pub update_poll_interval_secs: u64,
    /// Seconds between inventory pushes
    pub inventory_poll_interval_secs: u64,
    /// Seconds between retries of failed server calls
    pub retry_poll_interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            update_poll_interval_secs: 1800,
            inventory_poll_interval_secs: 28800,
            retry_poll_interval_secs: 300,
        }
    }
}

impl PollingConfig {
    pub fn update_poll_interval(&self) -> Duration {
        Duration::from_secs(self.update_poll_interval_secs)
    }

    pub fn inventory_poll_interval(&self) -> Duration {
        Duration::from_secs(self.inventory_poll_interval_secs)
    }

    pub fn retry_poll_interval(&self) -> Duration {
        Duration::from_secs(self.retry_poll_interval_secs)
    }
}

/// On-device directory layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the persistent agent state
    pub state_dir: PathBuf,
    /// Directory holding per-deployment logs
    pub deployment_log_dir: PathBuf,
    /// Read-only data shipped with the image
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/ferrite"),
            deployment_log_dir: PathBuf::from("/var/lib/ferrite/deployment-logs"),
            data_dir: PathBuf::from("/usr/share/ferrite"),
        }
    }
}

/// Device backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Backend type
    pub backend: DeviceBackend,
    /// Device type reported to the server; read from the data
    /// directory when unset
    pub device_type: Option<String>,
    /// File naming the artifact currently running
    pub artifact_info: PathBuf,
    /// Inactive rootfs partition written during install
    pub install_target: PathBuf,
    /// Command printing boot environment variables
    pub bootenv_print_command: String,
    /// Command making the running image permanent
    pub commit_command: String,
    /// Command restoring the previous image; the default clears the
    /// upgrade flag so the bootloader's fallback slot stays active
    pub rollback_command: String,
    /// Command rebooting the device
    pub reboot_command: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: DeviceBackend::Block,
            device_type: None,
            artifact_info: PathBuf::from("/etc/ferrite/artifact_info"),
            install_target: PathBuf::from("/dev/disk/by-partlabel/rootfs-inactive"),
            bootenv_print_command: "fw_printenv".to_string(),
            commit_command: "fw_setenv upgrade_available 0".to_string(),
            rollback_command: "fw_setenv upgrade_available 0".to_string(),
            reboot_command: "reboot".to_string(),
        }
    }
}

/// Device backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBackend {
    /// Mock backend for testing/development
    Mock,
    /// Real block device and bootloader commands
    #[default]
    Block,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.polling.update_poll_interval_secs, 1800);
        assert_eq!(
            config.polling.retry_poll_interval(),
            Duration::from_secs(300)
        );
        assert_eq!(config.paths.state_dir, PathBuf::from("/var/lib/ferrite"));
        assert_eq!(config.device.backend, DeviceBackend::Block);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: Config = serde_yaml::from_str(
            "server:\n  url: https://updates.internal\npolling:\n  update_poll_interval_secs: 60\n",
        )
        .unwrap();

        assert_eq!(config.server.url, "https://updates.internal");
        assert_eq!(config.polling.update_poll_interval_secs, 60);
        assert_eq!(config.polling.inventory_poll_interval_secs, 28800);
        assert_eq!(config.server.request_timeout_secs, 300);
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "ferrite-agent",
            "--server",
            "https://staging.updates.internal",
            "--update-poll-interval",
            "120",
            "--state-dir",
            "/tmp/ferrite-state",
            "--dev",
        ]);

        let config = Config::default_with_cli(&args);
        assert_eq!(config.server.url, "https://staging.updates.internal");
        assert_eq!(config.polling.update_poll_interval_secs, 120);
        assert_eq!(config.paths.state_dir, PathBuf::from("/tmp/ferrite-state"));
        assert_eq!(
            config.paths.deployment_log_dir,
            PathBuf::from("/tmp/ferrite-state/deployment-logs")
        );
        assert_eq!(config.device.backend, DeviceBackend::Mock);
    }

    #[test]
    fn test_device_type_from_marker_file() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("device_type"), "device_type=gateway-mk3\n").unwrap();

        let mut config = Config::default();
        config.paths.data_dir = dir.path().to_path_buf();
        assert_eq!(config.device_type(), "gateway-mk3");

        config.device.device_type = Some("override".to_string());
        assert_eq!(config.device_type(), "override");
    }
}
