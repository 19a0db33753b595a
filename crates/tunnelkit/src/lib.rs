//! tunnelkit: run command-line tools through a shared SSH SOCKS tunnel.
//!
//! A [`Stack`] owns one `ssh -D` dynamic-forward [`Tunnel`] and a local
//! HTTP proxy ([`tunnelkit_proxy::LocalProxy`]) dialing through it. Running
//! stacks are registered in an [`InstanceDirectory`] so that independent
//! invocations can discover and reuse a healthy one instead of opening a
//! second SSH session. The supervisor runs the target command with the
//! proxy environment applied and tears it down when the proxy fails.
//!
//! # Example
//!
//! ```no_run
//! use tunnelkit::{FileDirectory, InstanceDirectory};
//!
//! # fn main() -> tunnelkit::Result<()> {
//! let directory = FileDirectory::new(FileDirectory::default_path()?);
//! let config = directory.load()?;
//! for profile in &config.profiles {
//!     println!("{} -> {}@{}", profile.name, profile.user, profile.host);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod capture;
pub mod daemon;
pub mod directory;
pub mod env;
pub mod error;
pub mod health;
pub mod history;
pub mod ids;
pub mod process;
pub mod reuse;
pub mod runner;
pub mod signature;
pub mod stack;
pub mod supervisor;
pub mod tunnel;

pub use capture::BoundedBuffer;
pub use daemon::{instance_statuses, prune_instances, run_daemon, InstanceStatus};
pub use directory::{Config, FileDirectory, Instance, InstanceDirectory, Profile};
pub use error::{Result, TunnelkitError};
pub use health::{HealthClient, HealthError, HealthProbe};
pub use history::{PatchFailureRecorder, PatchHistoryEntry, PatchHistoryStore};
pub use process::{ProcessLauncher, SystemLauncher};
pub use reuse::{find_reusable_instance, is_instance_stale};
pub use runner::Runner;
pub use stack::{MonitorState, Stack, StackOptions};
pub use supervisor::{CrashRecorder, TargetOptions};
pub use tunnel::{Tunnel, TunnelConfig, TunnelExit};
