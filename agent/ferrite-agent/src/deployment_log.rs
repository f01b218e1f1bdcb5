//! Per-deployment error log capture.
//!
//! While a deployment is in flight the agent appends structured error
//! entries to a log file dedicated to that deployment. When a failure
//! is reported to the server the accumulated entries are uploaded as a
//! single JSON document so the backend can show why the deployment
//! failed. Logging failures are never allowed to break the update flow
//! itself.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// Finished deployment logs kept on disk before rotation.
const KEEP_LOGS: usize = 5;

/// A single captured log entry, one JSON object per line on disk.
#[derive(Debug, Serialize)]
struct LogEntry<'a> {
    time: String,
    level: &'a str,
    msg: &'a str,
}

/// Document shape uploaded to the server.
#[derive(Debug, Serialize)]
struct LogDocument {
    messages: Vec<serde_json::Value>,
}

/// Captures structured error entries into per-deployment log files.
pub struct DeploymentLogManager {
    log_dir: PathBuf,
    active: Option<ActiveLog>,
}

struct ActiveLog {
    deployment_id: String,
    path: PathBuf,
}

impl DeploymentLogManager {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            active: None,
        }
    }

    /// Start capturing entries for `deployment_id`.
    ///
    /// Re-enabling the deployment that is already active keeps
    /// appending to the same file, so the capture survives state
    /// transitions and post-reboot resumption within one deployment.
    pub fn enable(&mut self, deployment_id: &str) -> Result<()> {
        if let Some(active) = &self.active {
            if active.deployment_id == deployment_id {
                return Ok(());
            }
        }

        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("Failed to create log directory: {}", self.log_dir.display()))?;

        let path = match self.find_log_file(deployment_id)? {
            Some(existing) => existing,
            None => {
                let index = self.next_index()?;
                self.log_dir
                    .join(format!("deployments.{index:04}.{deployment_id}.log"))
            }
        };

        debug!(deployment_id = %deployment_id, path = %path.display(), "Deployment logging enabled");
        self.active = Some(ActiveLog {
            deployment_id: deployment_id.to_string(),
            path,
        });

        self.rotate();
        Ok(())
    }

    /// Stop capturing entries.
    pub fn disable(&mut self) {
        self.active = None;
    }

    /// Append an error entry to the active deployment log.
    ///
    /// A no-op when no deployment log is enabled; write failures are
    /// logged and swallowed.
    pub fn log_error(&mut self, msg: &str) {
        let Some(active) = &self.active else {
            return;
        };

        let entry = LogEntry {
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            level: "error",
            msg,
        };

        if let Err(err) = append_entry(&active.path, &entry) {
            warn!(error = %err, path = %active.path.display(), "Failed to write deployment log entry");
        }
    }

    /// Collect the captured entries for `deployment_id` as the upload
    /// document `{"messages": [...]}`.
    pub fn get_logs(&self, deployment_id: &str) -> Result<Vec<u8>> {
        let path = self
            .find_log_file(deployment_id)?
            .with_context(|| format!("No deployment log for {deployment_id}"))?;

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read deployment log: {}", path.display()))?;

        let mut messages = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(value) => messages.push(value),
                Err(err) => warn!(error = %err, "Skipping malformed deployment log entry"),
            }
        }

        Ok(serde_json::to_vec(&LogDocument { messages })?)
    }

    /// Newest log file recorded for `deployment_id`, if any.
    fn find_log_file(&self, deployment_id: &str) -> Result<Option<PathBuf>> {
        let suffix = format!(".{deployment_id}.log");
        Ok(self
            .list_logs()?
            .into_iter()
            .filter(|(_, name)| name.ends_with(&suffix))
            .max_by_key(|(index, _)| *index)
            .map(|(_, name)| self.log_dir.join(name)))
    }

    fn next_index(&self) -> Result<u32> {
        Ok(self
            .list_logs()?
            .into_iter()
            .map(|(index, _)| index)
            .max()
            .map_or(1, |max| max + 1))
    }

    /// All deployment log files as `(index, file name)` pairs.
    fn list_logs(&self) -> Result<Vec<(u32, String)>> {
        let entries = match fs::read_dir(&self.log_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("Failed to list log directory: {}", self.log_dir.display())
                })
            }
        };

        let mut logs = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(index) = parse_log_index(&name) {
                logs.push((index, name));
            }
        }
        Ok(logs)
    }

    /// Drop the oldest finished logs beyond the retention limit.
    fn rotate(&self) {
        let Ok(mut logs) = self.list_logs() else {
            return;
        };
        if logs.len() <= KEEP_LOGS {
            return;
        }

        logs.sort_by_key(|(index, _)| *index);
        let excess = logs.len() - KEEP_LOGS;
        for (_, name) in logs.into_iter().take(excess) {
            let path = self.log_dir.join(&name);
            if let Err(err) = fs::remove_file(&path) {
                warn!(error = %err, path = %path.display(), "Failed to rotate deployment log");
            }
        }
    }
}

fn append_entry(path: &Path, entry: &LogEntry<'_>) -> Result<()> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    serde_json::to_writer(&mut file, entry)?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Parse the index out of `deployments.NNNN.<id>.log` names.
fn parse_log_index(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("deployments.")?;
    if !name.ends_with(".log") {
        return None;
    }
    rest.split('.').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_capture_and_export() {
        let dir = TempDir::new().unwrap();
        let mut manager = DeploymentLogManager::new(dir.path());

        manager.enable("foobar").unwrap();
        manager.log_error("fetching update failed");
        manager.log_error("installing update failed");

        let logs = manager.get_logs("foobar").unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&logs).unwrap();
        let messages = doc["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["level"], "error");
        assert_eq!(messages[0]["msg"], "fetching update failed");
        assert_eq!(messages[1]["msg"], "installing update failed");
    }

    #[test]
    fn test_export_of_preexisting_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("deployments.0001.foobar.log"),
            "{ \"time\": \"12:12:12\", \"level\": \"error\", \"msg\": \"log foo\" }\n",
        )
        .unwrap();

        let manager = DeploymentLogManager::new(dir.path());
        let logs = manager.get_logs("foobar").unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&logs).unwrap();
        assert_eq!(doc["messages"][0]["msg"], "log foo");
        assert_eq!(doc["messages"][0]["time"], "12:12:12");
    }

    #[test]
    fn test_logging_without_enable_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let mut manager = DeploymentLogManager::new(dir.path());
        manager.log_error("dropped");
        assert!(manager.get_logs("foobar").is_err());
    }

    #[test]
    fn test_reenabling_same_deployment_appends() {
        let dir = TempDir::new().unwrap();
        let mut manager = DeploymentLogManager::new(dir.path());

        manager.enable("dep-1").unwrap();
        manager.log_error("first");
        manager.disable();
        manager.enable("dep-1").unwrap();
        manager.log_error("second");

        let doc: serde_json::Value =
            serde_json::from_slice(&manager.get_logs("dep-1").unwrap()).unwrap();
        assert_eq!(doc["messages"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_rotation_keeps_recent_logs() {
        let dir = TempDir::new().unwrap();
        let mut manager = DeploymentLogManager::new(dir.path());

        for i in 0..(KEEP_LOGS + 3) {
            manager.enable(&format!("dep-{i}")).unwrap();
            manager.log_error("entry");
        }

        let remaining = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, KEEP_LOGS);

        // The newest deployments survive.
        assert!(manager.get_logs(&format!("dep-{}", KEEP_LOGS + 2)).is_ok());
        assert!(manager.get_logs("dep-0").is_err());
    }
}
