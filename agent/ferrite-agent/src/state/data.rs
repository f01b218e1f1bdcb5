//! The checkpoint record persisted across reboots.
//!
//! States that must survive a reboot write a [`StateData`] record at
//! entry; the record is cleared on terminal completion. The serialized
//! state tags and the record layout are a compatibility surface shared
//! with every other build that may read the same store.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::controller::{ReportStatus, UpdateDescriptor};
use crate::store::{Store, StoreError};

/// Store key holding the checkpoint record.
pub const STATE_DATA_KEY: &str = "state";

/// Format tag of the records this build reads and writes.
pub const STATE_DATA_VERSION: u32 = 1;

/// Stable identifier of every state the machine can occupy.
///
/// The serde tags are the on-disk persistence contract and must not
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateId {
    #[default]
    Init,
    Bootstrapped,
    Authorized,
    AuthorizeWait,
    InventoryUpdate,
    CheckWait,
    UpdateCheck,
    UpdateFetch,
    FetchInstallRetry,
    UpdateInstall,
    UpdateVerify,
    UpdateCommit,
    UpdateStatusReport,
    ReportStatusError,
    Reboot,
    Rollback,
    Error,
    UpdateError,
    Final,
}

impl StateId {
    /// Canonical textual tag, identical to the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            StateId::Init => "init",
            StateId::Bootstrapped => "bootstrapped",
            StateId::Authorized => "authorized",
            StateId::AuthorizeWait => "authorize-wait",
            StateId::InventoryUpdate => "inventory-update",
            StateId::CheckWait => "check-wait",
            StateId::UpdateCheck => "update-check",
            StateId::UpdateFetch => "update-fetch",
            StateId::FetchInstallRetry => "fetch-install-retry",
            StateId::UpdateInstall => "update-install",
            StateId::UpdateVerify => "update-verify",
            StateId::UpdateCommit => "update-commit",
            StateId::UpdateStatusReport => "update-status-report",
            StateId::ReportStatusError => "report-status-error",
            StateId::Reboot => "reboot",
            StateId::Rollback => "rollback",
            StateId::Error => "error",
            StateId::UpdateError => "update-error",
            StateId::Final => "final",
        }
    }
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crash-consistent snapshot of the agent's intent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateData {
    /// Format tag; readers reject records from other versions.
    pub version: u32,
    /// State whose entry is being checkpointed.
    pub name: StateId,
    /// Deployment being acted on, absent when none is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdateDescriptor>,
    /// Status being reported, set only by the report state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReportStatus>,
}

/// Errors loading or storing the checkpoint record.
#[derive(Debug, Error)]
pub enum StateDataError {
    /// No checkpoint record exists.
    #[error("no checkpoint record")]
    NotFound,

    /// The record was written by a build with a different format.
    #[error("unsupported checkpoint record version {0}")]
    VersionMismatch(u32),

    /// The record does not parse.
    #[error("malformed checkpoint record: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The store itself failed.
    #[error(transparent)]
    Store(StoreError),
}

/// Write the checkpoint record. A zero version is stamped with the
/// current one.
pub fn store_state_data(store: &dyn Store, mut data: StateData) -> Result<(), StateDataError> {
    if data.version == 0 {
        data.version = STATE_DATA_VERSION;
    }
    debug!(name = %data.name, "Checkpointing state");
    let raw = serde_json::to_vec(&data)?;
    store
        .write_all(STATE_DATA_KEY, &raw)
        .map_err(StateDataError::Store)
}

/// Read the checkpoint record, rejecting records from other format
/// versions.
pub fn load_state_data(store: &dyn Store) -> Result<StateData, StateDataError> {
    let raw = match store.read_all(STATE_DATA_KEY) {
        Ok(raw) => raw,
        Err(err) if err.is_not_found() => return Err(StateDataError::NotFound),
        Err(err) => return Err(StateDataError::Store(err)),
    };
    let data: StateData = serde_json::from_slice(&raw)?;
    if data.version != STATE_DATA_VERSION {
        return Err(StateDataError::VersionMismatch(data.version));
    }
    Ok(data)
}

/// Drop the checkpoint record.
pub fn remove_state_data(store: &dyn Store) -> Result<(), StateDataError> {
    store.remove(STATE_DATA_KEY).map_err(StateDataError::Store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn sample_update() -> UpdateDescriptor {
        UpdateDescriptor {
            deployment_id: "foobar".to_string(),
            artifact_name: "release-2".to_string(),
            uri: "https://updates.example.com/a/foobar".to_string(),
            sha256: None,
        }
    }

    #[test]
    fn test_round_trip() {
        let store = MemStore::new();
        let data = StateData {
            version: STATE_DATA_VERSION,
            name: StateId::Init,
            update: Some(sample_update()),
            status: None,
        };

        store_state_data(&store, data.clone()).unwrap();
        assert_eq!(load_state_data(&store).unwrap(), data);
    }

    #[test]
    fn test_serialized_form_uses_canonical_tags() {
        let store = MemStore::new();
        store_state_data(
            &store,
            StateData {
                name: StateId::UpdateStatusReport,
                update: Some(sample_update()),
                status: Some(ReportStatus::AlreadyInstalled),
                ..Default::default()
            },
        )
        .unwrap();

        let raw = String::from_utf8(store.read_all(STATE_DATA_KEY).unwrap()).unwrap();
        assert!(raw.contains(r#""name":"update-status-report""#));
        assert!(raw.contains(r#""status":"already-installed""#));
    }

    #[test]
    fn test_zero_version_is_stamped() {
        let store = MemStore::new();
        store_state_data(
            &store,
            StateData {
                name: StateId::Reboot,
                update: Some(sample_update()),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(load_state_data(&store).unwrap().version, STATE_DATA_VERSION);
    }

    #[test]
    fn test_version_gate() {
        let store = MemStore::new();
        store_state_data(
            &store,
            StateData {
                version: 999,
                name: StateId::Init,
                update: Some(sample_update()),
                status: None,
            },
        )
        .unwrap();

        assert!(matches!(
            load_state_data(&store),
            Err(StateDataError::VersionMismatch(999))
        ));
    }

    #[test]
    fn test_missing_record() {
        let store = MemStore::new();
        assert!(matches!(
            load_state_data(&store),
            Err(StateDataError::NotFound)
        ));

        store_state_data(&store, StateData::default()).unwrap();
        remove_state_data(&store).unwrap();
        assert!(matches!(
            load_state_data(&store),
            Err(StateDataError::NotFound)
        ));
    }
}
