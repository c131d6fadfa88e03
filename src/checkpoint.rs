//! Checkpoint store for idempotent, resumable runs.
//!
//! A checkpoint records that a (year, month, variable) unit was started or
//! completed. The file-backed store keeps one sentinel file per state in the
//! checkpoint directory:
//! ```text
//! checkpoints/
//!   2024_06_t2m.started
//!   2024_06_tp.completed
//!   2024_07_tp.lock
//! ```
//! The `.lock` file is the exclusive-acquire primitive: it is created with
//! `create_new`, so only one runner can hold a key at a time.

use crate::error::{ProcessorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Identifies one monthly unit of one variable
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    pub year: i32,
    pub month: u32,
    pub variable: String,
}

impl CheckpointKey {
    pub fn new(year: i32, month: u32, variable: &str) -> Self {
        Self {
            year,
            month,
            variable: variable.to_string(),
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{:02}_{}", self.year, self.month, self.variable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Started,
    Completed,
}

impl CheckpointState {
    fn suffix(&self) -> &'static str {
        match self {
            CheckpointState::Started => "started",
            CheckpointState::Completed => "completed",
        }
    }
}

/// Durable key-value store of checkpoint states
pub trait CheckpointStore: Send + Sync {
    fn state(&self, key: &CheckpointKey) -> Result<Option<CheckpointState>>;

    fn has_completed(&self, key: &CheckpointKey) -> Result<bool> {
        Ok(self.state(key)? == Some(CheckpointState::Completed))
    }

    fn mark_started(&self, key: &CheckpointKey) -> Result<()>;

    fn mark_completed(&self, key: &CheckpointKey) -> Result<()>;

    /// Remove every state recorded for `key`
    fn clear(&self, key: &CheckpointKey) -> Result<()>;

    /// Try to take the exclusive lock for `key`; `false` if another runner holds it
    fn try_lock(&self, key: &CheckpointKey) -> Result<bool>;

    fn unlock(&self, key: &CheckpointKey) -> Result<()>;
}

/// Exclusive hold on one key, released on drop
pub struct CheckpointLease<'a> {
    store: &'a dyn CheckpointStore,
    key: CheckpointKey,
}

impl<'a> CheckpointLease<'a> {
    pub fn acquire(store: &'a dyn CheckpointStore, key: &CheckpointKey) -> Result<Self> {
        if !store.try_lock(key)? {
            return Err(ProcessorError::CheckpointBusy {
                key: key.to_string(),
            });
        }
        debug!("Acquired checkpoint lease {}", key);
        Ok(Self {
            store,
            key: key.clone(),
        })
    }

    pub fn key(&self) -> &CheckpointKey {
        &self.key
    }
}

impl Drop for CheckpointLease<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.unlock(&self.key) {
            warn!("Failed to release checkpoint lease {}: {}", self.key, e);
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MarkerRecord {
    key: String,
    state: CheckpointState,
    recorded_at: DateTime<Utc>,
}

/// Sentinel-file checkpoint store
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    stale_lock_after: Duration,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, stale_lock_after: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            stale_lock_after,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn marker_path(&self, key: &CheckpointKey, state: CheckpointState) -> PathBuf {
        self.dir.join(format!("{}.{}", key, state.suffix()))
    }

    fn lock_path(&self, key: &CheckpointKey) -> PathBuf {
        self.dir.join(format!("{key}.lock"))
    }

    /// Write a marker through a temporary file so it never appears half-written
    fn write_marker(&self, key: &CheckpointKey, state: CheckpointState) -> Result<()> {
        let record = MarkerRecord {
            key: key.to_string(),
            state,
            recorded_at: Utc::now(),
        };
        let target = self.marker_path(key, state);
        let tmp = target.with_extension(format!("{}.tmp", state.suffix()));
        fs::write(&tmp, serde_json::to_vec_pretty(&record)?)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn lock_is_stale(&self, lock: &Path) -> bool {
        let modified = match fs::metadata(lock).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return false,
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age > self.stale_lock_after)
            .unwrap_or(false)
    }

    fn create_lock(&self, lock: &Path) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(lock)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn state(&self, key: &CheckpointKey) -> Result<Option<CheckpointState>> {
        if self.marker_path(key, CheckpointState::Completed).is_file() {
            Ok(Some(CheckpointState::Completed))
        } else if self.marker_path(key, CheckpointState::Started).is_file() {
            Ok(Some(CheckpointState::Started))
        } else {
            Ok(None)
        }
    }

    fn mark_started(&self, key: &CheckpointKey) -> Result<()> {
        self.write_marker(key, CheckpointState::Started)
    }

    fn mark_completed(&self, key: &CheckpointKey) -> Result<()> {
        self.write_marker(key, CheckpointState::Completed)?;
        remove_if_present(&self.marker_path(key, CheckpointState::Started))
    }

    fn clear(&self, key: &CheckpointKey) -> Result<()> {
        remove_if_present(&self.marker_path(key, CheckpointState::Completed))?;
        remove_if_present(&self.marker_path(key, CheckpointState::Started))
    }

    fn try_lock(&self, key: &CheckpointKey) -> Result<bool> {
        let lock = self.lock_path(key);
        match self.create_lock(&lock) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if !self.lock_is_stale(&lock) {
                    return Ok(false);
                }
                warn!(
                    "Breaking stale checkpoint lock {} (older than {:?})",
                    lock.display(),
                    self.stale_lock_after
                );
                remove_if_present(&lock)?;
                match self.create_lock(&lock) {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn unlock(&self, key: &CheckpointKey) -> Result<()> {
        remove_if_present(&self.lock_path(key))
    }
}

/// In-process checkpoint store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    states: Mutex<HashMap<CheckpointKey, CheckpointState>>,
    locks: Mutex<HashSet<CheckpointKey>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> ProcessorError {
    ProcessorError::stage("checkpoint", "checkpoint store mutex poisoned")
}

impl CheckpointStore for MemoryCheckpointStore {
    fn state(&self, key: &CheckpointKey) -> Result<Option<CheckpointState>> {
        Ok(self.states.lock().map_err(poisoned)?.get(key).copied())
    }

    fn mark_started(&self, key: &CheckpointKey) -> Result<()> {
        self.states
            .lock()
            .map_err(poisoned)?
            .insert(key.clone(), CheckpointState::Started);
        Ok(())
    }

    fn mark_completed(&self, key: &CheckpointKey) -> Result<()> {
        self.states
            .lock()
            .map_err(poisoned)?
            .insert(key.clone(), CheckpointState::Completed);
        Ok(())
    }

    fn clear(&self, key: &CheckpointKey) -> Result<()> {
        self.states.lock().map_err(poisoned)?.remove(key);
        Ok(())
    }

    fn try_lock(&self, key: &CheckpointKey) -> Result<bool> {
        Ok(self.locks.lock().map_err(poisoned)?.insert(key.clone()))
    }

    fn unlock(&self, key: &CheckpointKey) -> Result<()> {
        self.locks.lock().map_err(poisoned)?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key() -> CheckpointKey {
        CheckpointKey::new(2024, 6, "t2m")
    }

    #[test]
    fn test_key_format() {
        assert_eq!(key().to_string(), "2024_06_t2m");
        assert_eq!(CheckpointKey::new(1985, 11, "tp").to_string(), "1985_11_tp");
    }

    #[test]
    fn test_file_store_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path().join("checkpoints"), Duration::from_secs(60)).unwrap();

        assert_eq!(store.state(&key()).unwrap(), None);

        store.mark_started(&key()).unwrap();
        assert_eq!(store.state(&key()).unwrap(), Some(CheckpointState::Started));
        assert!(store.dir().join("2024_06_t2m.started").is_file());
        assert!(!store.has_completed(&key()).unwrap());

        store.mark_completed(&key()).unwrap();
        assert_eq!(store.state(&key()).unwrap(), Some(CheckpointState::Completed));
        assert!(store.dir().join("2024_06_t2m.completed").is_file());
        assert!(!store.dir().join("2024_06_t2m.started").exists());

        store.clear(&key()).unwrap();
        assert_eq!(store.state(&key()).unwrap(), None);
    }

    #[test]
    fn test_marker_content_is_json_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path(), Duration::from_secs(60)).unwrap();
        store.mark_started(&key()).unwrap();

        let content = fs::read_to_string(temp_dir.path().join("2024_06_t2m.started")).unwrap();
        let record: MarkerRecord = serde_json::from_str(&content).unwrap();
        assert_eq!(record.key, "2024_06_t2m");
        assert_eq!(record.state, CheckpointState::Started);
    }

    #[test]
    fn test_file_lock_is_exclusive() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path(), Duration::from_secs(3600)).unwrap();

        let lease = CheckpointLease::acquire(&store, &key()).unwrap();
        assert_eq!(lease.key(), &key());

        match CheckpointLease::acquire(&store, &key()) {
            Err(ProcessorError::CheckpointBusy { key }) => assert_eq!(key, "2024_06_t2m"),
            other => panic!("Expected CheckpointBusy, got {:?}", other.map(|_| ())),
        }

        // Other keys are independent
        let other = CheckpointKey::new(2024, 7, "t2m");
        assert!(CheckpointLease::acquire(&store, &other).is_ok());

        drop(lease);
        assert!(CheckpointLease::acquire(&store, &key()).is_ok());
    }

    #[test]
    fn test_stale_lock_is_broken() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path(), Duration::ZERO).unwrap();

        fs::write(temp_dir.path().join("2024_06_t2m.lock"), "12345\n").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(store.try_lock(&key()).unwrap());
    }

    #[test]
    fn test_memory_store_lifecycle() {
        let store = MemoryCheckpointStore::new();
        assert!(store.try_lock(&key()).unwrap());
        assert!(!store.try_lock(&key()).unwrap());

        store.mark_started(&key()).unwrap();
        assert_eq!(store.state(&key()).unwrap(), Some(CheckpointState::Started));
        store.mark_completed(&key()).unwrap();
        assert!(store.has_completed(&key()).unwrap());

        store.unlock(&key()).unwrap();
        assert!(store.try_lock(&key()).unwrap());
    }
}
