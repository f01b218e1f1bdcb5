//! Persistent key-value store for small named blobs.
//!
//! The agent keeps its crash-consistent checkpoint (and little else)
//! in a store of named blobs. Two backends exist: [`DirStore`] writes
//! one file per key with an atomic rename so a crash mid-write leaves
//! the previous value intact, and [`MemStore`] keeps everything in
//! memory for development mode and tests.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use thiserror::Error;
use tracing::debug;

/// Errors produced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested key has no value.
    #[error("key not found: {0}")]
    NotFound(String),

    /// The store rejects writes.
    #[error("store is read-only")]
    ReadOnly,

    /// The store cannot be accessed at all.
    #[error("store access failed: {0}")]
    Access(String),

    /// Underlying filesystem failure.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the error means "no such key" rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Atomic read/write/remove of small named blobs.
///
/// Implementations must be atomic per key: a crash during
/// [`Store::write_all`] leaves the prior value intact, or no value if
/// the key never existed.
pub trait Store: Send + Sync {
    /// Replace the value under `key`.
    fn write_all(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Read the full value under `key`.
    fn read_all(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Remove `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// File-per-key store rooted at a directory.
///
/// Writes land in a temporary file that is fsynced and renamed over
/// the destination, so readers only ever observe complete values.
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    /// Create a store rooted at `dir`. The directory is created on the
    /// first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl Store for DirStore {
    fn write_all(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;

        let dest = self.path_for(key);
        let tmp = self.dir.join(format!("{key}.tmp"));

        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &dest)?;

        debug!(key = %key, bytes = data.len(), "Stored value");
        Ok(())
    }

    fn read_all(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.path_for(key)) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory store backing development mode and tests.
///
/// The fault toggles let tests exercise the failure paths of callers:
/// a read-only store rejects writes, a disabled store rejects
/// everything.
#[derive(Default)]
pub struct MemStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    read_only: AtomicBool,
    disabled: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes while `read_only` is set.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Reject every operation while `disabled` is set.
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    fn check_access(&self) -> Result<(), StoreError> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(StoreError::Access("store is disabled".to_string()));
        }
        Ok(())
    }
}

impl Store for MemStore {
    fn write_all(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.check_access()?;
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::ReadOnly);
        }
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::Access("lock poisoned".to_string()))?;
        entries.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn read_all(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.check_access()?;
        let entries = self
            .entries
            .read()
            .map_err(|_| StoreError::Access("lock poisoned".to_string()))?;
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.check_access()?;
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::ReadOnly);
        }
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::Access("lock poisoned".to_string()))?;
        entries.remove(key);
        Ok(())
    }
}
