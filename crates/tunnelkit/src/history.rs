//! Patch history: which target binaries were modified, and which failed.
//!
//! Stored as `patch_history.json` next to the directory file, with the same
//! lock-file and atomic-write protocol.

use crate::directory::{ensure_private_dir, lock_path_for, read_json, write_json, FileLock};
use crate::error::{Result, TunnelkitError};
use crate::supervisor::CrashRecorder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::info;

const HISTORY_FILE: &str = "patch_history.json";
const HISTORY_VERSION: u32 = 1;

/// One patched (or failed) binary, keyed by path and original hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchHistoryEntry {
    pub path: String,
    pub orig_sha256: String,
    pub patched_sha256: String,
    pub proxy_version: String,
    pub patched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_reason: String,
}

impl PatchHistoryEntry {
    fn matches(&self, path: &str, orig_sha256: &str) -> bool {
        self.path == path && self.orig_sha256 == orig_sha256
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchHistory {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub entries: Vec<PatchHistoryEntry>,
}

impl Default for PatchHistory {
    fn default() -> Self {
        Self {
            version: HISTORY_VERSION,
            entries: Vec::new(),
        }
    }
}

/// Locked access to `patch_history.json`.
#[derive(Debug)]
pub struct PatchHistoryStore {
    path: PathBuf,
    lock_path: PathBuf,
    mu: Mutex<()>,
}

impl PatchHistoryStore {
    /// Store rooted in `config_dir` (created with mode 0700 if missing).
    pub fn new(config_dir: &Path) -> Result<Self> {
        ensure_private_dir(config_dir).map_err(|e| TunnelkitError::directory(config_dir, e))?;
        let path = config_dir.join(HISTORY_FILE);
        Ok(Self {
            lock_path: lock_path_for(&path),
            path,
            mu: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<PatchHistory> {
        self.locked(|| self.load_unlocked())
    }

    pub fn update(&self, f: impl FnOnce(&mut PatchHistory) -> Result<()>) -> Result<()> {
        self.locked(|| {
            let mut history = self.load_unlocked()?;
            f(&mut history)?;
            if history.version == 0 {
                history.version = HISTORY_VERSION;
            }
            write_json(&self.path, &history)
        })
    }

    /// Insert or replace the entry for `(entry.path, entry.orig_sha256)`.
    pub fn upsert(&self, entry: PatchHistoryEntry) -> Result<()> {
        self.update(|history| {
            match history
                .entries
                .iter_mut()
                .find(|e| e.matches(&entry.path, &entry.orig_sha256))
            {
                Some(existing) => *existing = entry,
                None => history.entries.push(entry),
            }
            Ok(())
        })
    }

    pub fn find(&self, path: &str, orig_sha256: &str) -> Result<Option<PatchHistoryEntry>> {
        Ok(self
            .load()?
            .entries
            .into_iter()
            .find(|e| e.matches(path, orig_sha256)))
    }

    /// Most recently recorded entry for `path`, whatever its hash.
    pub fn latest_for_path(&self, path: &str) -> Result<Option<PatchHistoryEntry>> {
        Ok(self
            .load()?
            .entries
            .into_iter()
            .filter(|e| e.path == path)
            .max_by_key(|e| e.patched_at))
    }

    /// Whether a successful patch is recorded.
    pub fn is_patched(&self, path: &str, orig_sha256: &str) -> Result<bool> {
        Ok(self
            .find(path, orig_sha256)?
            .is_some_and(|e| !e.failed))
    }

    /// Whether a failed patch is recorded.
    pub fn is_failed(&self, path: &str, orig_sha256: &str) -> Result<bool> {
        Ok(self.find(path, orig_sha256)?.is_some_and(|e| e.failed))
    }

    pub fn remove(&self, path: &str, orig_sha256: &str) -> Result<()> {
        self.update(|history| {
            history.entries.retain(|e| !e.matches(path, orig_sha256));
            Ok(())
        })
    }

    fn locked<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.mu.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = FileLock::acquire(&self.lock_path)
            .map_err(|e| TunnelkitError::directory(&self.path, format!("lock failed: {}", e)))?;
        f()
    }

    fn load_unlocked(&self) -> Result<PatchHistory> {
        let mut history = read_json::<PatchHistory>(&self.path)?.unwrap_or_default();
        if history.version == 0 {
            history.version = HISTORY_VERSION;
        }
        Ok(history)
    }
}

/// Marks a target binary as failed when the supervisor sees a crash.
#[derive(Debug)]
pub struct PatchFailureRecorder {
    store: PatchHistoryStore,
    path: String,
    orig_sha256: String,
    proxy_version: String,
}

impl PatchFailureRecorder {
    pub fn new(
        store: PatchHistoryStore,
        path: impl Into<String>,
        orig_sha256: impl Into<String>,
        proxy_version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            path: path.into(),
            orig_sha256: orig_sha256.into(),
            proxy_version: proxy_version.into(),
        }
    }
}

impl CrashRecorder for PatchFailureRecorder {
    fn record_crash(&self, reason: &str) -> Result<()> {
        let previous = self.store.find(&self.path, &self.orig_sha256)?;
        let entry = PatchHistoryEntry {
            path: self.path.clone(),
            orig_sha256: self.orig_sha256.clone(),
            patched_sha256: previous.map(|e| e.patched_sha256).unwrap_or_default(),
            proxy_version: self.proxy_version.clone(),
            patched_at: Utc::now(),
            failed: true,
            failure_reason: reason.to_string(),
        };
        self.store.upsert(entry)?;
        info!("Recorded failure for {}: {}", self.path, reason);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(path: &str, orig: &str) -> PatchHistoryEntry {
        PatchHistoryEntry {
            path: path.to_string(),
            orig_sha256: orig.to_string(),
            patched_sha256: "patched".to_string(),
            proxy_version: "0.3.0".to_string(),
            patched_at: Utc::now(),
            failed: false,
            failure_reason: String::new(),
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = PatchHistoryStore::new(dir.path()).unwrap();
        assert_eq!(store.load().unwrap(), PatchHistory::default());
        assert!(!store.is_patched("/bin/codex", "abc").unwrap());
        assert!(!store.is_failed("/bin/codex", "abc").unwrap());
    }

    #[test]
    fn test_upsert_keyed_on_path_and_hash() {
        let dir = tempdir().unwrap();
        let store = PatchHistoryStore::new(dir.path()).unwrap();
        store.upsert(entry("/bin/codex", "abc")).unwrap();
        store.upsert(entry("/bin/codex", "def")).unwrap();

        let mut failed = entry("/bin/codex", "abc");
        failed.failed = true;
        failed.failure_reason = "exec format error".to_string();
        store.upsert(failed).unwrap();

        let history = store.load().unwrap();
        assert_eq!(history.entries.len(), 2);
        assert!(store.is_failed("/bin/codex", "abc").unwrap());
        assert!(!store.is_patched("/bin/codex", "abc").unwrap());
        assert!(store.is_patched("/bin/codex", "def").unwrap());

        store.remove("/bin/codex", "abc").unwrap();
        assert!(store.find("/bin/codex", "abc").unwrap().is_none());
        assert_eq!(store.load().unwrap().entries.len(), 1);
    }

    #[test]
    fn test_latest_for_path() {
        let dir = tempdir().unwrap();
        let store = PatchHistoryStore::new(dir.path()).unwrap();
        let mut old = entry("/bin/codex", "old");
        old.patched_at = Utc::now() - chrono::Duration::days(1);
        store.upsert(old).unwrap();
        store.upsert(entry("/bin/codex", "new")).unwrap();
        store.upsert(entry("/bin/other", "x")).unwrap();

        let latest = store.latest_for_path("/bin/codex").unwrap().unwrap();
        assert_eq!(latest.orig_sha256, "new");
        assert!(store.latest_for_path("/bin/missing").unwrap().is_none());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let dir = tempdir().unwrap();
        let store = PatchHistoryStore::new(dir.path()).unwrap();
        store.upsert(entry("/bin/codex", "abc")).unwrap();
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"origSha256\""));
        assert!(!raw.contains("failureReason"));
        assert!(!raw.contains("\"failed\""));
    }

    #[test]
    fn test_failure_recorder_marks_entry() {
        let dir = tempdir().unwrap();
        let store = PatchHistoryStore::new(dir.path()).unwrap();
        store.upsert(entry("/bin/codex", "abc")).unwrap();

        let recorder = PatchFailureRecorder::new(
            PatchHistoryStore::new(dir.path()).unwrap(),
            "/bin/codex",
            "abc",
            "0.3.0",
        );
        recorder.record_crash("Segmentation fault").unwrap();

        let got = store.find("/bin/codex", "abc").unwrap().unwrap();
        assert!(got.failed);
        assert_eq!(got.failure_reason, "Segmentation fault");
        assert_eq!(got.patched_sha256, "patched");
    }
}
