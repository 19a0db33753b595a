//! File-backed directory with cross-process locking.
//!
//! Every read and write happens under an exclusive `fs2` lock on
//! `<path>.lock` plus an in-process mutex (advisory file locks do not
//! exclude threads of the same process on every platform). Writes go to a
//! temp sibling that is fsynced and renamed over the target, so readers
//! never observe a torn file.

use super::config::{Config, CURRENT_VERSION};
use super::InstanceDirectory;
use crate::error::{Result, TunnelkitError};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Directory name under the user config dir.
const APP_DIR: &str = "tunnelkit";
const CONFIG_FILE: &str = "config.json";

/// Mode for the config directory.
pub(crate) const DIR_MODE: u32 = 0o700;
/// Mode for files holding directory state.
pub(crate) const FILE_MODE: u32 = 0o600;

/// Exclusive advisory lock on a sidecar file, released on drop.
#[derive(Debug)]
pub(crate) struct FileLock {
    file: File,
}

impl FileLock {
    /// Block until the exclusive lock on `lock_path` is held.
    pub(crate) fn acquire(lock_path: &Path) -> io::Result<Self> {
        if let Some(parent) = lock_path.parent() {
            ensure_private_dir(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// `<path>.lock`
pub(crate) fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

/// Create `dir` (and parents) with mode 0700 if missing.
pub(crate) fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(dir)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}

fn temp_sibling_path(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("state");
    let mut token = [0u8; 4];
    let suffix = match getrandom::fill(&mut token) {
        Ok(()) => format!("{:08x}", u32::from_le_bytes(token)),
        Err(_) => std::process::id().to_string(),
    };
    parent.join(format!(".{}.{}.tmp", file_name, suffix))
}

/// Write `content` to `path` atomically with the given mode.
pub(crate) fn atomic_write(path: &Path, content: &[u8], mode: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }
    let tmp = temp_sibling_path(path);
    let result = (|| {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Read and parse a JSON file, or `None` if it does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(TunnelkitError::directory(path, format!("read failed: {}", e))),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| TunnelkitError::directory(path, format!("parse failed: {}", e)))
}

/// Pretty-print `value` with a trailing newline and write it atomically.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut content = serde_json::to_string_pretty(value)
        .map_err(|e| TunnelkitError::directory(path, format!("serialize failed: {}", e)))?;
    content.push('\n');
    atomic_write(path, content.as_bytes(), FILE_MODE)
        .map_err(|e| TunnelkitError::directory(path, format!("write failed: {}", e)))
}

/// Instance directory stored as one JSON file.
#[derive(Debug)]
pub struct FileDirectory {
    path: PathBuf,
    lock_path: PathBuf,
    mu: Mutex<()>,
}

impl FileDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self {
            path,
            lock_path,
            mu: Mutex::new(()),
        }
    }

    /// `<user config dir>/tunnelkit/config.json`
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir().ok_or_else(|| {
            TunnelkitError::InvalidConfig("cannot determine user config directory".to_string())
        })?;
        Ok(base.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Directory holding the config file (and logs, patch history).
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Replace the whole file with `config`.
    pub fn save(&self, config: &Config) -> Result<()> {
        self.locked(|| self.save_unlocked(config.clone()))
    }

    fn locked<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.mu.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = FileLock::acquire(&self.lock_path)
            .map_err(|e| TunnelkitError::directory(&self.path, format!("lock failed: {}", e)))?;
        f()
    }

    fn load_unlocked(&self) -> Result<Config> {
        let Some(mut config) = read_json::<Config>(&self.path)? else {
            return Ok(Config::default());
        };
        if config.version == 0 {
            config.version = CURRENT_VERSION;
        }
        if config.version != CURRENT_VERSION {
            return Err(TunnelkitError::directory(
                &self.path,
                format!(
                    "unsupported config version {} (expected {})",
                    config.version, CURRENT_VERSION
                ),
            ));
        }
        Ok(config)
    }

    fn save_unlocked(&self, mut config: Config) -> Result<()> {
        if config.version == 0 {
            config.version = CURRENT_VERSION;
        }
        if config.version != CURRENT_VERSION {
            return Err(TunnelkitError::directory(
                &self.path,
                format!(
                    "refusing to write config version {} (expected {})",
                    config.version, CURRENT_VERSION
                ),
            ));
        }
        write_json(&self.path, &config)
    }
}

impl InstanceDirectory for FileDirectory {
    fn load(&self) -> Result<Config> {
        self.locked(|| self.load_unlocked())
    }

    fn update(&self, f: &mut dyn FnMut(&mut Config) -> Result<()>) -> Result<()> {
        self.locked(|| {
            let mut config = self.load_unlocked()?;
            f(&mut config)?;
            self.save_unlocked(config)
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::directory::Instance;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn instance(id: &str) -> Instance {
        let now = Utc::now();
        Instance {
            id: id.to_string(),
            profile_id: "p1".to_string(),
            http_port: 18080,
            socks_port: 11080,
            daemon_pid: 1234,
            started_at: now,
            last_seen_at: now,
        }
    }

    #[test]
    fn test_missing_file_loads_default() {
        let dir = tempdir().unwrap();
        let store = FileDirectory::new(dir.path().join("nested").join("config.json"));
        let cfg = store.load().unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn test_round_trip_is_identical() {
        let dir = tempdir().unwrap();
        let store = FileDirectory::new(dir.path().join("config.json"));
        let inst = instance("i1");
        store.record_instance(inst.clone()).unwrap();

        let cfg = store.load().unwrap();
        assert_eq!(cfg.instances, vec![inst]);
        assert_eq!(cfg.version, CURRENT_VERSION);

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.ends_with("}\n"));
        assert!(raw.contains("\n  \"instances\""));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_and_dir_modes() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let cfg_dir = dir.path().join("tk");
        let store = FileDirectory::new(cfg_dir.join("config.json"));
        store.save(&Config::default()).unwrap();

        let file_mode = fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, FILE_MODE);
        let dir_mode = fs::metadata(&cfg_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, DIR_MODE);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"version":2,"profiles":[],"instances":[]}"#).unwrap();
        let store = FileDirectory::new(&path);
        let err = store.load().unwrap_err();
        assert!(err.to_string().contains("unsupported config version 2"));
        assert!(store.update(&mut |_| Ok(())).is_err());
    }

    #[test]
    fn test_version_zero_reads_as_current() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"profiles":[],"instances":[]}"#).unwrap();
        let cfg = FileDirectory::new(&path).load().unwrap();
        assert_eq!(cfg.version, CURRENT_VERSION);
    }

    #[test]
    fn test_heartbeat_only_touches_last_seen() {
        let dir = tempdir().unwrap();
        let store = FileDirectory::new(dir.path().join("config.json"));
        let inst = instance("i1");
        store.record_instance(inst.clone()).unwrap();

        let later = inst.last_seen_at + ChronoDuration::seconds(30);
        store.heartbeat("i1", later).unwrap();

        let got = store.load().unwrap().instances.remove(0);
        assert_eq!(got.last_seen_at, later);
        assert_eq!(
            Instance {
                last_seen_at: inst.last_seen_at,
                ..got
            },
            inst
        );
    }

    #[test]
    fn test_heartbeat_missing_instance_errors() {
        let dir = tempdir().unwrap();
        let store = FileDirectory::new(dir.path().join("config.json"));
        assert!(store.heartbeat("ghost", Utc::now()).is_err());
    }

    #[test]
    fn test_remove_twice_is_fine() {
        let dir = tempdir().unwrap();
        let store = FileDirectory::new(dir.path().join("config.json"));
        store.record_instance(instance("i1")).unwrap();
        store.remove_instance("i1").unwrap();
        store.remove_instance("i1").unwrap();
        assert!(store.load().unwrap().instances.is_empty());
    }

    #[test]
    fn test_failed_update_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let store = FileDirectory::new(dir.path().join("config.json"));
        store.record_instance(instance("i1")).unwrap();
        let before = fs::read_to_string(store.path()).unwrap();

        let err = store.update(&mut |cfg| {
            cfg.instances.clear();
            Err(TunnelkitError::InvalidConfig("abort".to_string()))
        });
        assert!(err.is_err());
        assert_eq!(fs::read_to_string(store.path()).unwrap(), before);
    }

    #[test]
    fn test_concurrent_updates_are_serialized() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut handles = Vec::new();
        for t in 0..4 {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                // separate stores so only the file lock serializes them
                let store = FileDirectory::new(path);
                for i in 0..10 {
                    store.record_instance(instance(&format!("t{}-{}", t, i))).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let cfg = FileDirectory::new(&path).load().unwrap();
        assert_eq!(cfg.instances.len(), 40);

        let shared = Arc::new(FileDirectory::new(&path));
        shared.remove_instance("t0-0").unwrap();
        assert_eq!(shared.load().unwrap().instances.len(), 39);
    }

    #[test]
    fn test_lock_path() {
        assert_eq!(
            lock_path_for(Path::new("/tmp/x/config.json")),
            PathBuf::from("/tmp/x/config.json.lock")
        );
    }
}
