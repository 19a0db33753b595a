//! Persisted directory model: profiles and running instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// On-disk format version understood by this build.
pub const CURRENT_VERSION: u32 = 1;

/// Root of the directory file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Format version; a missing or zero version is read as current.
    #[serde(default)]
    pub version: u32,

    /// Saved proxy preference for `run` when neither `--proxy` nor
    /// `--no-proxy` is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_enabled: Option<bool>,

    /// Whether yolo arguments should be passed to the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yolo_enabled: Option<bool>,

    #[serde(default)]
    pub profiles: Vec<Profile>,

    #[serde(default)]
    pub instances: Vec<Instance>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            proxy_enabled: None,
            yolo_enabled: None,
            profiles: Vec::new(),
            instances: Vec::new(),
        }
    }
}

/// SSH connection settings for one remote network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_args: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A running (or pending) proxy stack registered by some process.
///
/// `http_port == 0` and `daemon_pid == 0` mark a daemon that has been
/// requested but has not reported back yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub profile_id: String,
    pub http_port: u16,
    pub socks_port: u16,
    pub daemon_pid: i32,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Config {
    /// Find a profile by id, or by name ignoring case.
    pub fn find_profile(&self, reference: &str) -> Option<&Profile> {
        let reference = reference.trim();
        if reference.is_empty() {
            return None;
        }
        self.profiles
            .iter()
            .find(|p| p.id == reference || p.name.eq_ignore_ascii_case(reference))
    }

    /// Insert `profile`, replacing any profile with the same id.
    pub fn upsert_profile(&mut self, profile: Profile) {
        match self.profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(existing) => *existing = profile,
            None => self.profiles.push(profile),
        }
    }

    /// Remove a profile and every instance recorded for it.
    ///
    /// Returns `false` if no profile had that id.
    pub fn remove_profile(&mut self, id: &str) -> bool {
        let before = self.profiles.len();
        self.profiles.retain(|p| p.id != id);
        if self.profiles.len() == before {
            return false;
        }
        self.instances.retain(|i| i.profile_id != id);
        true
    }

    /// Instances recorded for `profile_id`, in file order.
    pub fn instances_for_profile(&self, profile_id: &str) -> Vec<Instance> {
        self.instances
            .iter()
            .filter(|i| i.profile_id == profile_id)
            .cloned()
            .collect()
    }

    pub fn find_instance(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    /// Insert `instance`, replacing any instance with the same id.
    pub fn upsert_instance(&mut self, instance: Instance) {
        match self.instances.iter_mut().find(|i| i.id == instance.id) {
            Some(existing) => *existing = instance,
            None => self.instances.push(instance),
        }
    }

    /// Remove the instance with `id`; `false` if it was not present.
    pub fn remove_instance(&mut self, id: &str) -> bool {
        let before = self.instances.len();
        self.instances.retain(|i| i.id != id);
        self.instances.len() != before
    }
}
