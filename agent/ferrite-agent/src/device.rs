//! Thin device collaborators.
//!
//! The state machine only needs a handful of operations from the
//! device: write an artifact stream to the inactive rootfs partition,
//! read and clear the bootloader's `upgrade_available` flag, reboot,
//! and name the running artifact. The bootloader specifics stay behind
//! configured helper commands so one agent build serves U-Boot and
//! GRUB devices alike.

use std::path::PathBuf;
use std::process::Command;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::controller::ArtifactStream;
use crate::error::AgentError;

/// Key in the artifact info file naming the running artifact.
const ARTIFACT_NAME_KEY: &str = "artifact_name";

/// Boot environment flag set while an update awaits its first boot.
const UPGRADE_FLAG: &str = "upgrade_available";

/// Device operations consumed by the controller façade.
#[async_trait]
pub trait DeviceOps: Send + Sync {
    /// Name of the artifact currently running.
    fn artifact_name(&self) -> String;

    /// Write the artifact to the inactive partition.
    async fn install(&self, stream: ArtifactStream, size: u64) -> Result<(), AgentError>;

    /// Whether the bootloader switched partitions this boot.
    async fn has_upgrade(&self) -> Result<bool, AgentError>;

    /// Make the running image permanent.
    async fn commit(&self) -> Result<(), AgentError>;

    /// Restore the previous image.
    async fn rollback(&self) -> Result<(), AgentError>;

    /// Reboot the device.
    async fn reboot(&self) -> Result<(), AgentError>;
}

/// Production device backed by a block-device target and bootloader
/// helper commands.
pub struct BlockDevice {
    install_target: PathBuf,
    artifact_info: PathBuf,
    bootenv_print_command: String,
    commit_command: String,
    rollback_command: String,
    reboot_command: String,
}

impl BlockDevice {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            install_target: config.install_target.clone(),
            artifact_info: config.artifact_info.clone(),
            bootenv_print_command: config.bootenv_print_command.clone(),
            commit_command: config.commit_command.clone(),
            rollback_command: config.rollback_command.clone(),
            reboot_command: config.reboot_command.clone(),
        }
    }
}

#[async_trait]
impl DeviceOps for BlockDevice {
    fn artifact_name(&self) -> String {
        match std::fs::read_to_string(&self.artifact_info) {
            Ok(content) => match parse_artifact_name(&content) {
                Some(name) => name,
                None => {
                    warn!(
                        path = %self.artifact_info.display(),
                        "Artifact info file has no artifact_name entry"
                    );
                    "unknown".to_string()
                }
            },
            Err(err) => {
                warn!(
                    error = %err,
                    path = %self.artifact_info.display(),
                    "Failed to read the artifact info file"
                );
                "unknown".to_string()
            }
        }
    }

    async fn install(&self, mut stream: ArtifactStream, size: u64) -> Result<(), AgentError> {
        info!(
            target = %self.install_target.display(),
            size,
            "Writing the artifact to the inactive partition"
        );

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.install_target)
            .await
            .map_err(AgentError::fatal)?;

        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(AgentError::fatal)?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(AgentError::fatal)?;
        file.sync_all().await.map_err(AgentError::fatal)?;

        if written != size {
            return Err(AgentError::transient(format!(
                "short artifact payload: expected {size} bytes, wrote {written}"
            )));
        }

        info!(written, "Artifact written");
        Ok(())
    }

    async fn has_upgrade(&self) -> Result<bool, AgentError> {
        let output = run_command(&self.bootenv_print_command, &[UPGRADE_FLAG])?;
        let value = output
            .lines()
            .find_map(|line| line.trim().strip_prefix(&format!("{UPGRADE_FLAG}=")))
            .map(str::trim)
            .unwrap_or("0");
        Ok(value == "1")
    }

    async fn commit(&self) -> Result<(), AgentError> {
        info!("Committing the running image");
        run_command(&self.commit_command, &[]).map(drop)
    }

    async fn rollback(&self) -> Result<(), AgentError> {
        info!("Pointing the bootloader back at the previous image");
        run_command(&self.rollback_command, &[]).map(drop)
    }

    async fn reboot(&self) -> Result<(), AgentError> {
        run_command(&self.reboot_command, &[]).map(drop)
    }
}

/// Run a configured helper command with extra arguments appended.
fn run_command(command: &str, extra_args: &[&str]) -> Result<String, AgentError> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| AgentError::fatal("empty device command configured"))?;

    debug!(command = %command, "Running device command");
    let output = Command::new(program)
        .args(parts)
        .args(extra_args)
        .output()
        .map_err(|err| AgentError::fatal(format!("failed to run {program}: {err}")))?;

    if !output.status.success() {
        return Err(AgentError::fatal(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Pull the artifact name out of a key=value artifact info file.
fn parse_artifact_name(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let line = line.trim();
        if line.starts_with('#') {
            return None;
        }
        let (key, value) = line.split_once('=')?;
        if key.trim() == ARTIFACT_NAME_KEY {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// In-memory device for development mode.
///
/// Simulates the happy half of the device contract: installs land in a
/// byte counter, the upgrade flag flips on install and clears on
/// commit or rollback, and reboot is a no-op.
pub struct MockDevice {
    state: std::sync::RwLock<MockDeviceState>,
}

struct MockDeviceState {
    artifact_name: String,
    upgrade_available: bool,
}

impl MockDevice {
    pub fn new() -> Self {
        info!("Creating mock device backend");
        Self {
            state: std::sync::RwLock::new(MockDeviceState {
                artifact_name: "mock-artifact".to_string(),
                upgrade_available: false,
            }),
        }
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceOps for MockDevice {
    fn artifact_name(&self) -> String {
        self.state
            .read()
            .map(|state| state.artifact_name.clone())
            .unwrap_or_else(|_| "mock-artifact".to_string())
    }

    async fn install(&self, mut stream: ArtifactStream, _size: u64) -> Result<(), AgentError> {
        let mut written = 0;
        while let Some(chunk) = stream.next().await {
            written += chunk?.len() as u64;
        }
        let mut state = self
            .state
            .write()
            .map_err(|_| AgentError::fatal("lock poisoned"))?;
        state.upgrade_available = true;
        info!(written, "Mock install finished");
        Ok(())
    }

    async fn has_upgrade(&self) -> Result<bool, AgentError> {
        Ok(self
            .state
            .read()
            .map(|state| state.upgrade_available)
            .unwrap_or(false))
    }

    async fn commit(&self) -> Result<(), AgentError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| AgentError::fatal("lock poisoned"))?;
        state.upgrade_available = false;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), AgentError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| AgentError::fatal("lock poisoned"))?;
        state.upgrade_available = false;
        Ok(())
    }

    async fn reboot(&self) -> Result<(), AgentError> {
        info!("Mock device reboot requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt as _;

    use super::*;

    #[test]
    fn test_parse_artifact_name() {
        let content = "# release metadata\nartifact_name=release-2\ndevice_type=gateway\n";
        assert_eq!(parse_artifact_name(content).as_deref(), Some("release-2"));

        assert_eq!(parse_artifact_name("device_type=gateway\n"), None);
        assert_eq!(
            parse_artifact_name("artifact_name = spaced \n").as_deref(),
            Some("spaced")
        );
    }

    #[tokio::test]
    async fn test_block_device_install_writes_stream() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("rootfs-b");
        let device = BlockDevice {
            install_target: target.clone(),
            artifact_info: dir.path().join("artifact_info"),
            bootenv_print_command: "true".to_string(),
            commit_command: "true".to_string(),
            rollback_command: "true".to_string(),
            reboot_command: "true".to_string(),
        };

        let chunks = vec![
            Ok(bytes::Bytes::from_static(b"ferrite ")),
            Ok(bytes::Bytes::from_static(b"image")),
        ];
        let stream = futures::stream::iter(chunks).boxed();
        device.install(stream, 13).await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"ferrite image");
    }

    #[tokio::test]
    async fn test_block_device_install_rejects_short_payload() {
        let dir = tempfile::TempDir::new().unwrap();
        let device = BlockDevice {
            install_target: dir.path().join("rootfs-b"),
            artifact_info: dir.path().join("artifact_info"),
            bootenv_print_command: "true".to_string(),
            commit_command: "true".to_string(),
            rollback_command: "true".to_string(),
            reboot_command: "true".to_string(),
        };

        let stream = futures::stream::iter(vec![Ok(bytes::Bytes::from_static(b"tiny"))]).boxed();
        let err = device.install(stream, 100).await.unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("short artifact payload"));
    }

    #[tokio::test]
    async fn test_mock_device_flag_lifecycle() {
        let device = MockDevice::new();
        assert!(!device.has_upgrade().await.unwrap());

        let stream = futures::stream::iter(vec![Ok(bytes::Bytes::from_static(b"test"))]).boxed();
        device.install(stream, 4).await.unwrap();
        assert!(device.has_upgrade().await.unwrap());

        device.commit().await.unwrap();
        assert!(!device.has_upgrade().await.unwrap());
    }
}
