//! Cross-process registry of profiles and running proxy instances.
//!
//! Several independent `tunnelkit` processes read and mutate the same
//! directory. [`InstanceDirectory::update`] is the only mutation primitive:
//! it runs load, mutate and persist as one step under an exclusive lock, so
//! concurrent writers never lose each other's changes.

mod config;
mod store;

pub use config::{Config, Instance, Profile, CURRENT_VERSION};
pub use store::FileDirectory;

pub(crate) use store::{ensure_private_dir, lock_path_for, read_json, write_json, FileLock};

use crate::error::{Result, TunnelkitError};
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::info;

/// Persistent store for [`Config`].
pub trait InstanceDirectory: Send + Sync {
    /// Read a consistent snapshot.
    fn load(&self) -> Result<Config>;

    /// Atomically load, apply `f`, and persist.
    ///
    /// If `f` returns an error nothing is written.
    fn update(&self, f: &mut dyn FnMut(&mut Config) -> Result<()>) -> Result<()>;

    /// Location of the backing file.
    fn path(&self) -> &Path;

    /// Insert or replace `instance`.
    fn record_instance(&self, instance: Instance) -> Result<()> {
        self.update(&mut |cfg| {
            cfg.upsert_instance(instance.clone());
            Ok(())
        })?;
        info!(
            "Registered instance {} (http port {})",
            instance.id, instance.http_port
        );
        Ok(())
    }

    /// Remove the instance with `id`. Missing ids are not an error.
    fn remove_instance(&self, id: &str) -> Result<()> {
        let mut removed = false;
        self.update(&mut |cfg| {
            removed = cfg.remove_instance(id);
            Ok(())
        })?;
        if removed {
            info!("Removed instance {}", id);
        }
        Ok(())
    }

    /// Set `last_seen_at` of instance `id` to `at`.
    fn heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let path = self.path().to_path_buf();
        self.update(&mut |cfg| {
            match cfg.instances.iter_mut().find(|i| i.id == id) {
                Some(inst) => {
                    inst.last_seen_at = at;
                    Ok(())
                }
                None => Err(TunnelkitError::directory(
                    &path,
                    format!("instance {} not found", id),
                )),
            }
        })
    }
}
