//! Long-lived proxy daemons and the instance bookkeeping around them.

use crate::cancel::{self, CancelReceiver};
use crate::directory::{Config, Instance, InstanceDirectory};
use crate::error::{Result, TunnelkitError};
use crate::health::HealthProbe;
use crate::process;
use crate::reuse::is_instance_stale;
use crate::runner::Heartbeat;
use crate::stack::{Stack, StackOptions};
use chrono::Utc;
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Run the stack for a pre-registered instance until cancelled or fatal.
///
/// Non-zero ports recorded on the instance are pinned. Once the stack is
/// up, the record gets this process's PID, the real ports and a fresh
/// `started_at`. The record is removed when the daemon ends, whichever way.
pub async fn run_daemon(
    directory: Arc<dyn InstanceDirectory>,
    instance_id: &str,
    mut stack_options: StackOptions,
    heartbeat_interval: Duration,
    cancel: &mut CancelReceiver,
) -> Result<()> {
    let config = directory.load()?;
    let pending = config
        .find_instance(instance_id)
        .cloned()
        .ok_or_else(|| TunnelkitError::InvalidConfig(format!("instance {} not found", instance_id)))?;
    let profile = config
        .profiles
        .iter()
        .find(|p| p.id == pending.profile_id)
        .cloned()
        .ok_or_else(|| {
            TunnelkitError::InvalidConfig(format!(
                "profile {} of instance {} not found",
                pending.profile_id, instance_id
            ))
        })?;

    if pending.http_port != 0 {
        stack_options.http_listen_addr = format!("127.0.0.1:{}", pending.http_port);
    }
    if pending.socks_port != 0 {
        stack_options.socks_port = pending.socks_port;
    }

    let stack = match Stack::start(&profile, instance_id, stack_options, cancel).await {
        Ok(stack) => stack,
        Err(TunnelkitError::Cancelled) => {
            info!("Daemon for instance {} cancelled while starting", instance_id);
            forget(directory.as_ref(), instance_id);
            return Ok(());
        }
        Err(e) => {
            forget(directory.as_ref(), instance_id);
            return Err(e);
        }
    };

    let now = Utc::now();
    let running = Instance {
        http_port: stack.http_port(),
        socks_port: stack.socks_port(),
        daemon_pid: Pid::this().as_raw(),
        started_at: now,
        last_seen_at: now,
        ..pending
    };
    if let Err(e) = directory.record_instance(running) {
        if let Err(close_err) = stack.close().await {
            warn!("Failed to close proxy stack {}: {}", instance_id, close_err);
        }
        return Err(e);
    }
    info!(
        "Daemon for instance {} serving {} (profile {})",
        instance_id,
        stack.http_proxy_url(),
        profile.name
    );

    let heartbeat = Heartbeat::spawn(directory.clone(), instance_id.to_string(), heartbeat_interval);
    let mut fatal = stack.take_fatal();
    let result = tokio::select! {
        reason = recv_fatal(fatal.as_mut()) => Err(TunnelkitError::StackFatal(reason)),
        _ = cancel::cancelled(cancel) => {
            info!("Daemon for instance {} stopping", instance_id);
            Ok(())
        }
    };

    heartbeat.stop().await;
    forget(directory.as_ref(), instance_id);
    if let Err(e) = stack.close().await {
        warn!("Failed to close proxy stack {}: {}", instance_id, e);
    }
    result
}

async fn recv_fatal(fatal: Option<&mut tokio::sync::mpsc::Receiver<String>>) -> String {
    match fatal {
        Some(rx) => match rx.recv().await {
            Some(reason) => reason,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

fn forget(directory: &dyn InstanceDirectory, instance_id: &str) {
    if let Err(e) = directory.remove_instance(instance_id) {
        warn!("Failed to remove instance {}: {}", instance_id, e);
    }
}

/// Liveness of a registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Alive,
    /// The daemon PID is not running.
    Dead,
    /// The daemon runs but has not recorded its HTTP port yet.
    Starting,
    /// The daemon runs but its proxy fails the health check.
    Unhealthy,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Alive => write!(f, "alive"),
            InstanceStatus::Dead => write!(f, "dead"),
            InstanceStatus::Starting => write!(f, "starting"),
            InstanceStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

pub fn instance_status(inst: &Instance, probe: &dyn HealthProbe) -> InstanceStatus {
    if !process::is_alive(inst.daemon_pid) {
        InstanceStatus::Dead
    } else if inst.http_port == 0 {
        InstanceStatus::Starting
    } else if probe.check(inst.http_port, &inst.id).is_err() {
        InstanceStatus::Unhealthy
    } else {
        InstanceStatus::Alive
    }
}

/// Status of every instance in `config`, in directory order.
pub fn instance_statuses(config: &Config, probe: &dyn HealthProbe) -> Vec<(Instance, InstanceStatus)> {
    config
        .instances
        .iter()
        .map(|inst| (inst.clone(), instance_status(inst, probe)))
        .collect()
}

/// Remove dead and unhealthy instances in one directory update.
///
/// Returns how many were removed.
pub fn prune_instances(directory: &dyn InstanceDirectory, probe: &dyn HealthProbe) -> Result<usize> {
    let mut removed = 0;
    directory.update(&mut |cfg| {
        let before = cfg.instances.len();
        cfg.instances.retain(|inst| !is_instance_stale(inst, probe));
        removed = before - cfg.instances.len();
        Ok(())
    })?;
    if removed > 0 {
        info!("Pruned {} stale instance(s)", removed);
    }
    Ok(removed)
}
