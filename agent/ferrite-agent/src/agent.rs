//! The production controller: server client, device backend, and
//! configuration composed behind the façade the state machine drives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::controller::{ArtifactStream, CheckOutcome, Controller, ReportStatus, UpdateDescriptor};
use crate::device::DeviceOps;
use crate::error::AgentError;
use crate::server::ServerClient;
use crate::store::Store;

/// Store key holding the generated device identity.
const DEVICE_ID_KEY: &str = "device-id";

/// The deployed agent: one handle over everything the state machine
/// needs from the outside world.
pub struct DeviceAgent {
    device_type: String,
    update_poll: Duration,
    inventory_poll: Duration,
    retry_poll: Duration,
    server: ServerClient,
    device: Box<dyn DeviceOps>,
    store: Arc<dyn Store>,
}

impl DeviceAgent {
    pub fn new(
        config: &Config,
        server: ServerClient,
        device: Box<dyn DeviceOps>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            device_type: config.device_type(),
            update_poll: config.polling.update_poll_interval(),
            inventory_poll: config.polling.inventory_poll_interval(),
            retry_poll: config.polling.retry_poll_interval(),
            server,
            device,
            store,
        }
    }

    fn device_id(&self) -> Result<String, AgentError> {
        let raw = self
            .store
            .read_all(DEVICE_ID_KEY)
            .map_err(|err| AgentError::fatal(format!("device identity unavailable: {err}")))?;
        String::from_utf8(raw).map_err(|_| AgentError::fatal("device identity is not valid UTF-8"))
    }
}

#[async_trait]
impl Controller for DeviceAgent {
    async fn bootstrap(&self) -> Result<(), AgentError> {
        match self.store.read_all(DEVICE_ID_KEY) {
            Ok(_) => {
                debug!("Device identity already present");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                let device_id = Uuid::new_v4().to_string();
                self.store
                    .write_all(DEVICE_ID_KEY, device_id.as_bytes())
                    .map_err(|err| {
                        AgentError::fatal(format!("failed to persist the device identity: {err}"))
                    })?;
                info!(device_id = %device_id, "Generated a device identity");
                Ok(())
            }
            Err(err) => Err(AgentError::fatal(format!(
                "failed to read the device identity: {err}"
            ))),
        }
    }

    async fn authorize(&self) -> Result<(), AgentError> {
        let device_id = self.device_id()?;
        self.server.authorize(&device_id, &self.device_type).await
    }

    fn current_artifact_name(&self) -> String {
        self.device.artifact_name()
    }

    async fn has_upgrade(&self) -> Result<bool, AgentError> {
        self.device.has_upgrade().await
    }

    fn update_poll_interval(&self) -> Duration {
        self.update_poll
    }

    fn inventory_poll_interval(&self) -> Duration {
        self.inventory_poll
    }

    fn retry_poll_interval(&self) -> Duration {
        self.retry_poll
    }

    async fn check_update(&self) -> Result<CheckOutcome, AgentError> {
        let running = self.device.artifact_name();
        let offered = self.server.check_update(&self.device_type, &running).await?;
        Ok(classify_check(offered, &running))
    }

    async fn fetch_update(
        &self,
        uri: &str,
        expected_sha256: Option<&str>,
    ) -> Result<(ArtifactStream, u64), AgentError> {
        self.server.fetch_update(uri, expected_sha256).await
    }

    async fn report_update_status(
        &self,
        update: &UpdateDescriptor,
        status: ReportStatus,
    ) -> Result<(), AgentError> {
        self.server.report_status(update, status).await
    }

    async fn upload_log(&self, update: &UpdateDescriptor, logs: &[u8]) -> Result<(), AgentError> {
        self.server.upload_log(update, logs).await
    }

    async fn inventory_refresh(&self) -> Result<(), AgentError> {
        let hostname = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        let attributes = [
            ("device_type", self.device_type.clone()),
            ("artifact_name", self.device.artifact_name()),
            ("hostname", hostname),
            ("agent_version", env!("CARGO_PKG_VERSION").to_string()),
        ];
        self.server.push_inventory(&attributes).await
    }

    async fn install_update(&self, stream: ArtifactStream, size: u64) -> Result<(), AgentError> {
        self.device.install(stream, size).await
    }

    async fn commit_update(&self) -> Result<(), AgentError> {
        self.device.commit().await
    }

    async fn rollback(&self) -> Result<(), AgentError> {
        self.device.rollback().await
    }

    async fn reboot(&self) -> Result<(), AgentError> {
        self.device.reboot().await
    }
}

/// Sort a deployment check response into its outcome: the server
/// offering the artifact that is already running means there is
/// nothing to install, only a report to send.
fn classify_check(offered: Option<UpdateDescriptor>, running: &str) -> CheckOutcome {
    match offered {
        None => CheckOutcome::NoUpdate,
        Some(update) if update.artifact_name == running => CheckOutcome::AlreadyInstalled(update),
        Some(update) => CheckOutcome::Update(update),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::device::MockDevice;
    use crate::store::MemStore;

    fn test_agent(store: Arc<MemStore>) -> DeviceAgent {
        DeviceAgent::new(
            &Config::default(),
            ServerClient::new(&ServerConfig::default()),
            Box::new(MockDevice::new()),
            store,
        )
    }

    #[tokio::test]
    async fn test_bootstrap_generates_identity_once() {
        let store = Arc::new(MemStore::new());
        let agent = test_agent(store.clone());

        agent.bootstrap().await.unwrap();
        let first = store.read_all(DEVICE_ID_KEY).unwrap();
        assert!(!first.is_empty());

        agent.bootstrap().await.unwrap();
        assert_eq!(store.read_all(DEVICE_ID_KEY).unwrap(), first);
    }

    #[tokio::test]
    async fn test_bootstrap_propagates_store_failure() {
        let store = Arc::new(MemStore::new());
        store.set_disabled(true);
        let agent = test_agent(store);

        let err = agent.bootstrap().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_classify_check() {
        assert!(matches!(classify_check(None, "r1"), CheckOutcome::NoUpdate));

        let offered = UpdateDescriptor {
            deployment_id: "my-id".to_string(),
            artifact_name: "r1".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            classify_check(Some(offered.clone()), "r1"),
            CheckOutcome::AlreadyInstalled(_)
        ));
        assert!(matches!(
            classify_check(Some(offered), "r0"),
            CheckOutcome::Update(_)
        ));
    }
}
