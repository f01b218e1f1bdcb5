//! The controller façade consumed by the update state machine.
//!
//! The state machine never talks to the deployment server or the
//! device directly; everything goes through [`Controller`], one
//! capability interface that composes identity, server client, device
//! installer, and polling configuration. Tests substitute the whole
//! surface with a scripted mock.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Byte stream of a fetched artifact.
///
/// Ownership of the stream moves with the state carrying it; dropping
/// it on any exit path releases the underlying transfer.
pub type ArtifactStream = BoxStream<'static, Result<Bytes, AgentError>>;

/// A deployment the server has assigned to this device.
///
/// Immutable once received; lives until the deployment terminates with
/// a report or a rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDescriptor {
    /// Opaque deployment identifier.
    pub deployment_id: String,
    /// Artifact the deployment installs, compared against the running
    /// artifact after reboot.
    pub artifact_name: String,
    /// Download location of the artifact payload.
    pub uri: String,
    /// Expected SHA-256 of the payload, verified while downloading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Progress states reported to the deployment server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportStatus {
    Downloading,
    Installing,
    Rebooting,
    Success,
    Failure,
    AlreadyInstalled,
}

impl ReportStatus {
    /// Wire-level tag of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Downloading => "downloading",
            ReportStatus::Installing => "installing",
            ReportStatus::Rebooting => "rebooting",
            ReportStatus::Success => "success",
            ReportStatus::Failure => "failure",
            ReportStatus::AlreadyInstalled => "already-installed",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of asking the server for a new deployment.
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    /// Nothing pending for this device.
    NoUpdate,
    /// A new deployment to apply.
    Update(UpdateDescriptor),
    /// The server offered the artifact that is already running.
    AlreadyInstalled(UpdateDescriptor),
}

/// Uniform handle to device operations, server operations, and polling
/// configuration.
#[async_trait]
pub trait Controller: Send + Sync {
    // =========================================================================
    // Identity & authorization
    // =========================================================================

    /// Set up the device identity on first run.
    async fn bootstrap(&self) -> Result<(), AgentError>;

    /// Obtain or refresh server credentials.
    async fn authorize(&self) -> Result<(), AgentError>;

    // =========================================================================
    // Device introspection
    // =========================================================================

    /// Name of the artifact currently installed and running.
    fn current_artifact_name(&self) -> String;

    /// Whether the bootloader switched to the new partition this boot.
    async fn has_upgrade(&self) -> Result<bool, AgentError>;

    // =========================================================================
    // Polling configuration
    // =========================================================================

    fn update_poll_interval(&self) -> Duration;
    fn inventory_poll_interval(&self) -> Duration;
    fn retry_poll_interval(&self) -> Duration;

    // =========================================================================
    // Server operations
    // =========================================================================

    /// Ask the server for a pending deployment.
    async fn check_update(&self) -> Result<CheckOutcome, AgentError>;

    /// Open the artifact byte stream. Returns the stream and its total
    /// size in bytes. When a digest is given the stream fails instead
    /// of ending cleanly if the payload does not match.
    async fn fetch_update(
        &self,
        uri: &str,
        expected_sha256: Option<&str>,
    ) -> Result<(ArtifactStream, u64), AgentError>;

    /// Report deployment progress. May fail with
    /// [`AgentError::DeploymentAborted`] when the server has cancelled
    /// the deployment.
    async fn report_update_status(
        &self,
        update: &UpdateDescriptor,
        status: ReportStatus,
    ) -> Result<(), AgentError>;

    /// Upload the captured deployment log.
    async fn upload_log(&self, update: &UpdateDescriptor, logs: &[u8]) -> Result<(), AgentError>;

    /// Push current inventory attributes to the server.
    async fn inventory_refresh(&self) -> Result<(), AgentError>;

    // =========================================================================
    // Device operations
    // =========================================================================

    /// Write the artifact stream to the inactive partition.
    async fn install_update(&self, stream: ArtifactStream, size: u64) -> Result<(), AgentError>;

    /// Make the new image permanent.
    async fn commit_update(&self) -> Result<(), AgentError>;

    /// Restore the previous image.
    async fn rollback(&self) -> Result<(), AgentError>;

    /// Reboot the device.
    async fn reboot(&self) -> Result<(), AgentError>;
}

#[cfg(test)]
pub mod mock {
    //! Scripted controller used by the state machine tests.

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use futures::StreamExt;

    use super::*;

    /// Controller double with scripted responses and recorded calls.
    pub struct MockController {
        // Scripted responses
        pub artifact_name: String,
        pub poll_interval: Duration,
        /// Inventory interval, falling back to `poll_interval`.
        pub inventory_interval: Option<Duration>,
        pub retry_interval: Duration,
        pub bootstrap_err: Option<AgentError>,
        pub authorize_err: Option<AgentError>,
        pub has_upgrade: bool,
        pub has_upgrade_err: Option<AgentError>,
        pub check: Result<CheckOutcome, AgentError>,
        pub fetch_data: Vec<u8>,
        pub fetch_err: Option<AgentError>,
        pub install_err: Option<AgentError>,
        pub commit_err: Option<AgentError>,
        pub rollback_err: Option<AgentError>,
        pub reboot_err: Option<AgentError>,
        pub report_err: Option<AgentError>,
        pub log_upload_err: Option<AgentError>,
        pub inventory_err: Option<AgentError>,
        // Recorded calls
        pub reports: Mutex<Vec<(UpdateDescriptor, ReportStatus)>>,
        pub uploaded_logs: Mutex<Vec<Vec<u8>>>,
        pub fetch_calls: AtomicU32,
        pub install_calls: AtomicU32,
        pub installed_bytes: AtomicU32,
    }

    impl Default for MockController {
        fn default() -> Self {
            Self {
                artifact_name: String::new(),
                poll_interval: Duration::from_secs(5),
                inventory_interval: None,
                retry_interval: Duration::from_secs(1),
                bootstrap_err: None,
                authorize_err: None,
                has_upgrade: false,
                has_upgrade_err: None,
                check: Ok(CheckOutcome::NoUpdate),
                fetch_data: Vec::new(),
                fetch_err: None,
                install_err: None,
                commit_err: None,
                rollback_err: None,
                reboot_err: None,
                report_err: None,
                log_upload_err: None,
                inventory_err: None,
                reports: Mutex::new(Vec::new()),
                uploaded_logs: Mutex::new(Vec::new()),
                fetch_calls: AtomicU32::new(0),
                install_calls: AtomicU32::new(0),
                installed_bytes: AtomicU32::new(0),
            }
        }
    }

    impl MockController {
        /// Last status reported for any deployment, if one was sent.
        pub fn last_report(&self) -> Option<(UpdateDescriptor, ReportStatus)> {
            self.reports.lock().unwrap().last().cloned()
        }

        pub fn report_count(&self) -> usize {
            self.reports.lock().unwrap().len()
        }
    }

    fn scripted(err: &Option<AgentError>) -> Result<(), AgentError> {
        match err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    #[async_trait]
    impl Controller for MockController {
        async fn bootstrap(&self) -> Result<(), AgentError> {
            scripted(&self.bootstrap_err)
        }

        async fn authorize(&self) -> Result<(), AgentError> {
            scripted(&self.authorize_err)
        }

        fn current_artifact_name(&self) -> String {
            self.artifact_name.clone()
        }

        async fn has_upgrade(&self) -> Result<bool, AgentError> {
            match &self.has_upgrade_err {
                Some(err) => Err(err.clone()),
                None => Ok(self.has_upgrade),
            }
        }

        fn update_poll_interval(&self) -> Duration {
            self.poll_interval
        }

        fn inventory_poll_interval(&self) -> Duration {
            self.inventory_interval.unwrap_or(self.poll_interval)
        }

        fn retry_poll_interval(&self) -> Duration {
            self.retry_interval
        }

        async fn check_update(&self) -> Result<CheckOutcome, AgentError> {
            self.check.clone()
        }

        async fn fetch_update(
            &self,
            _uri: &str,
            _expected_sha256: Option<&str>,
        ) -> Result<(ArtifactStream, u64), AgentError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = &self.fetch_err {
                return Err(err.clone());
            }
            let data = self.fetch_data.clone();
            let size = data.len() as u64;
            let stream = futures::stream::iter(vec![Ok(Bytes::from(data))]).boxed();
            Ok((stream, size))
        }

        async fn report_update_status(
            &self,
            update: &UpdateDescriptor,
            status: ReportStatus,
        ) -> Result<(), AgentError> {
            self.reports
                .lock()
                .unwrap()
                .push((update.clone(), status));
            scripted(&self.report_err)
        }

        async fn upload_log(
            &self,
            _update: &UpdateDescriptor,
            logs: &[u8],
        ) -> Result<(), AgentError> {
            self.uploaded_logs.lock().unwrap().push(logs.to_vec());
            scripted(&self.log_upload_err)
        }

        async fn inventory_refresh(&self) -> Result<(), AgentError> {
            scripted(&self.inventory_err)
        }

        async fn install_update(
            &self,
            mut stream: ArtifactStream,
            _size: u64,
        ) -> Result<(), AgentError> {
            self.install_calls.fetch_add(1, Ordering::SeqCst);
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                self.installed_bytes
                    .fetch_add(chunk.len() as u32, Ordering::SeqCst);
            }
            scripted(&self.install_err)
        }

        async fn commit_update(&self) -> Result<(), AgentError> {
            scripted(&self.commit_err)
        }

        async fn rollback(&self) -> Result<(), AgentError> {
            scripted(&self.rollback_err)
        }

        async fn reboot(&self) -> Result<(), AgentError> {
            scripted(&self.reboot_err)
        }
    }
}
