//! Persisted runtime state.
//!
//! `.dev/pid.json` maps a server name to the process devrack launched for it.
//! Every invocation is short-lived, so this file is the only memory shared
//! between runs. Writes replace the whole snapshot through a temp file and a
//! rename; readers never observe a partial file.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DevError, Result};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Lifecycle status stored alongside a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Starting,
    Healthy,
    #[serde(alias = "dead")]
    Unhealthy,
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RecordStatus::Starting => "starting",
            RecordStatus::Healthy => "healthy",
            RecordStatus::Unhealthy => "unhealthy",
        };
        f.write_str(label)
    }
}

/// What devrack knows about one launched server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeRecord {
    pub pid: u32,
    /// The port the server actually bound, not necessarily the preferred one.
    pub port: u16,
    /// ISO-8601 timestamp, kept verbatim so rewrites never alter live entries.
    pub start_time: String,
    pub status: RecordStatus,
}

impl RuntimeRecord {
    pub fn starting(pid: u32, port: u16) -> Self {
        Self {
            pid,
            port,
            start_time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            status: RecordStatus::Starting,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.start_time)
            .ok()
            .map(|time| time.with_timezone(&Utc))
    }
}

/// Snapshot contents: server name to record.
pub type StateMap = BTreeMap<String, RuntimeRecord>;

/// File-backed store for [`StateMap`] snapshots.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

/// Exclusive advisory lock over the store, released on drop.
#[derive(Debug)]
pub struct StateLock {
    file: File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the persisted mapping, or an empty one on first run.
    pub fn load(&self) -> Result<StateMap> {
        if !self.path.exists() {
            return Ok(StateMap::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw).map_err(|source| DevError::CorruptState {
            path: self.path.clone(),
            source,
        })
    }

    /// Replaces the persisted snapshot with `records`.
    pub fn save(&self, records: &StateMap) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(records).map_err(|source| {
            DevError::CorruptState {
                path: self.path.clone(),
                source,
            }
        })?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, &self.path)?;

        debug!(path = %self.path.display(), records = records.len(), "saved state");
        Ok(())
    }

    /// Waits until this invocation holds the store's read-modify-write lock.
    ///
    /// Without it two concurrent `start` runs could both see a free slot for
    /// the same server between their load and save. Another invocation may
    /// hold the lock through a whole startup, so contention is polled rather
    /// than blocking a runtime worker.
    pub async fn lock(&self) -> Result<StateLock> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path.with_extension("json.lock"))?;
        let contended = fs2::lock_contended_error().kind();
        let mut waited = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(StateLock { file }),
                Err(err) if err.kind() == contended => {
                    if !waited {
                        debug!(path = %self.path.display(), "state locked by another invocation, waiting");
                        waited = true;
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: u32, port: u16) -> RuntimeRecord {
        RuntimeRecord {
            pid,
            port,
            start_time: "2024-05-01T10:00:00.000Z".to_string(),
            status: RecordStatus::Healthy,
        }
    }

    #[test]
    fn missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join(".dev/pid.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn save_then_load_yields_same_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join(".dev/pid.json"));
        let mut records = StateMap::new();
        records.insert("web".into(), record(100, 3000));
        records.insert(
            "api".into(),
            RuntimeRecord {
                status: RecordStatus::Starting,
                ..record(200, 8081)
            },
        );

        store.save(&records).unwrap();
        assert_eq!(store.load().unwrap(), records);
        assert!(!dir.path().join(".dev/pid.json.tmp").exists());
    }

    #[test]
    fn uses_camel_case_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("pid.json"));
        let mut records = StateMap::new();
        records.insert("web".into(), record(100, 3000));
        store.save(&records).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["web"]["startTime"], "2024-05-01T10:00:00.000Z");
        assert_eq!(value["web"]["status"], "healthy");
        assert_eq!(value["web"]["pid"], 100);
    }

    #[test]
    fn accepts_snapshots_written_by_older_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("pid.json"));
        fs::write(
            store.path(),
            r#"{"web": {"pid": 1, "port": 5173, "startTime": "2024-05-01T10:00:00.000Z", "status": "dead"}}"#,
        )
        .unwrap();
        let records = store.load().unwrap();
        assert_eq!(records["web"].status, RecordStatus::Unhealthy);
        assert!(records["web"].started_at().is_some());
    }

    #[test]
    fn malformed_snapshot_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("pid.json"));
        fs::write(store.path(), "{\"web\": {\"pid\": ").unwrap();
        assert!(matches!(store.load(), Err(DevError::CorruptState { .. })));
    }

    #[test]
    fn starting_record_has_parseable_timestamp() {
        let record = RuntimeRecord::starting(42, 3000);
        assert_eq!(record.status, RecordStatus::Starting);
        assert!(record.start_time.ends_with('Z'));
        assert!(record.started_at().is_some());
    }

    #[tokio::test]
    async fn lock_is_reacquirable_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join(".dev/pid.json"));
        let lock = store.lock().await.unwrap();
        drop(lock);
        let _again = store.lock().await.unwrap();
    }

    #[tokio::test]
    async fn contended_lock_waits_without_blocking_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join(".dev/pid.json"));
        let held = store.lock().await.unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.lock().await.map(|_| ()) })
        };
        // The current-thread test runtime keeps ticking while the waiter polls.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let acquired = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(acquired.is_ok());
    }
}
