//! Thin HTTP client for the deployment server.
//!
//! Only the handful of calls the agent needs: device authorization,
//! deployment polling, streaming artifact download, status reporting,
//! deployment log upload, and the inventory push. Connection problems
//! and server 5xx responses surface as transient errors so the state
//! machine's backoff schedules take over; a 409 on a status report
//! means the backend aborted the deployment.

use std::pin::Pin;
use std::sync::RwLock;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::controller::{ArtifactStream, ReportStatus, UpdateDescriptor};
use crate::error::AgentError;

/// Wire shape of a pending deployment.
#[derive(Debug, Deserialize)]
struct DeploymentResponse {
    id: String,
    artifact_name: String,
    uri: String,
    #[serde(default)]
    sha256: Option<String>,
}

/// Client for the deployment server API.
pub struct ServerClient {
    base_url: String,
    tenant_token: Option<String>,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl ServerClient {
    pub fn new(config: &ServerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            tenant_token: config.tenant_token.clone(),
            client,
            token: RwLock::new(None),
        }
    }

    fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|token| token.clone())
    }

    fn authorized_get(&self, url: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.get(url);
        if let Some(token) = self.token() {
            request = request.bearer_auth(token);
        }
        request
    }

    /// Request an API token for this device.
    pub async fn authorize(
        &self,
        device_id: &str,
        device_type: &str,
    ) -> Result<(), AgentError> {
        let url = format!("{}/api/devices/v1/authentication/auth_requests", self.base_url);
        let body = serde_json::json!({
            "device_id": device_id,
            "device_type": device_type,
            "tenant_token": self.tenant_token,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => {
                let token = response.text().await.map_err(transport_error)?;
                if let Ok(mut slot) = self.token.write() {
                    *slot = Some(token);
                }
                info!("Device authorized with the deployment server");
                Ok(())
            }
            StatusCode::UNAUTHORIZED => Err(AgentError::transient(
                "device is not yet accepted by the server",
            )),
            status => Err(status_error(status, "authorization request rejected")),
        }
    }

    /// Ask for the next deployment targeting this device.
    pub async fn check_update(
        &self,
        device_type: &str,
        artifact_name: &str,
    ) -> Result<Option<UpdateDescriptor>, AgentError> {
        let url = format!(
            "{}/api/devices/v1/deployments/device/deployments/next?artifact_name={}&device_type={}",
            self.base_url, artifact_name, device_type
        );
        debug!(url = %url, "Checking for a deployment");

        let response = self
            .authorized_get(&url)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let deployment: DeploymentResponse =
                    response.json().await.map_err(transport_error)?;
                Ok(Some(UpdateDescriptor {
                    deployment_id: deployment.id,
                    artifact_name: deployment.artifact_name,
                    uri: deployment.uri,
                    sha256: deployment.sha256,
                }))
            }
            StatusCode::UNAUTHORIZED => Err(AgentError::transient(
                "server rejected the device token",
            )),
            status => Err(status_error(status, "deployment check failed")),
        }
    }

    /// Open the artifact byte stream.
    ///
    /// When `expected_sha256` is given the returned stream verifies the
    /// digest after the last chunk and fails instead of ending cleanly
    /// on a mismatch.
    pub async fn fetch_update(
        &self,
        uri: &str,
        expected_sha256: Option<&str>,
    ) -> Result<(ArtifactStream, u64), AgentError> {
        let response = self
            .authorized_get(uri)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, "artifact download rejected"));
        }

        let size = response
            .content_length()
            .ok_or_else(|| AgentError::fatal("server did not provide the artifact size"))?;

        let stream = response.bytes_stream().map_err(transport_error).boxed();
        let stream = match expected_sha256 {
            Some(expected) => verify_sha256(stream, expected.to_string()),
            None => stream,
        };

        debug!(size, "Artifact stream opened");
        Ok((stream, size))
    }

    /// Report deployment progress.
    pub async fn report_status(
        &self,
        update: &UpdateDescriptor,
        status: ReportStatus,
    ) -> Result<(), AgentError> {
        let url = format!(
            "{}/api/devices/v1/deployments/device/deployments/{}/status",
            self.base_url, update.deployment_id
        );

        let response = self
            .client
            .put(&url)
            .bearer_auth(self.token().unwrap_or_default())
            .json(&serde_json::json!({ "status": status.as_str() }))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(AgentError::DeploymentAborted),
            status => Err(status_error(status, "status report rejected")),
        }
    }

    /// Upload the deployment log document.
    pub async fn upload_log(
        &self,
        update: &UpdateDescriptor,
        logs: &[u8],
    ) -> Result<(), AgentError> {
        let url = format!(
            "{}/api/devices/v1/deployments/device/deployments/{}/log",
            self.base_url, update.deployment_id
        );

        let response = self
            .client
            .put(&url)
            .bearer_auth(self.token().unwrap_or_default())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(logs.to_vec())
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status, "deployment log upload rejected"))
        }
    }

    /// Push inventory attributes.
    pub async fn push_inventory(&self, attributes: &[(&str, String)]) -> Result<(), AgentError> {
        let url = format!(
            "{}/api/devices/v1/inventory/device/attributes",
            self.base_url
        );
        let body: Vec<serde_json::Value> = attributes
            .iter()
            .map(|(name, value)| serde_json::json!({ "name": name, "value": value }))
            .collect();

        let response = self
            .client
            .patch(&url)
            .bearer_auth(self.token().unwrap_or_default())
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status, "inventory push rejected"))
        }
    }
}

/// Map a transport failure; everything at this layer is retriable.
fn transport_error(err: reqwest::Error) -> AgentError {
    if err.is_timeout() {
        warn!(error = %err, "Request to the deployment server timed out");
    }
    AgentError::transient(err)
}

/// Map a non-success HTTP status onto an error severity.
fn status_error(status: StatusCode, what: &str) -> AgentError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AgentError::transient(format!("{what}: HTTP {status}"))
    } else {
        AgentError::fatal(format!("{what}: HTTP {status}"))
    }
}

/// Wrap `inner` so the digest of everything that passed through is
/// checked once the stream ends.
fn verify_sha256(inner: ArtifactStream, expected: String) -> ArtifactStream {
    VerifyingStream {
        inner,
        hasher: Some(Sha256::new()),
        expected,
    }
    .boxed()
}

struct VerifyingStream {
    inner: ArtifactStream,
    hasher: Option<Sha256>,
    expected: String,
}

impl Stream for VerifyingStream {
    type Item = Result<Bytes, AgentError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match futures::ready!(this.inner.poll_next_unpin(cx)) {
            Some(Ok(chunk)) => {
                if let Some(hasher) = this.hasher.as_mut() {
                    hasher.update(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => match this.hasher.take() {
                Some(hasher) => {
                    let actual = hex::encode(hasher.finalize());
                    if actual == this.expected {
                        Poll::Ready(None)
                    } else {
                        Poll::Ready(Some(Err(AgentError::transient(format!(
                            "artifact checksum mismatch: expected {}, got {}",
                            this.expected, actual
                        )))))
                    }
                }
                None => Poll::Ready(None),
            },
        }
    }
}
