//! Selection of an existing instance to reuse.

use crate::directory::Instance;
use crate::health::HealthProbe;
use crate::process;
use tracing::debug;

/// Pick the freshest healthy instance of `profile_id`.
///
/// An instance qualifies when its daemon PID is positive and alive and the
/// proxy on its HTTP port answers the health probe with its own id. Among
/// qualifying instances the one with the strictly greatest `last_seen_at`
/// wins; on a tie the earlier one in `instances` is kept.
pub fn find_reusable_instance(
    instances: &[Instance],
    profile_id: &str,
    probe: &dyn HealthProbe,
) -> Option<Instance> {
    let mut best: Option<&Instance> = None;
    for inst in instances.iter().filter(|i| i.profile_id == profile_id) {
        if !process::is_alive(inst.daemon_pid) {
            debug!("Skipping instance {}: pid {} not alive", inst.id, inst.daemon_pid);
            continue;
        }
        if let Err(e) = probe.check(inst.http_port, &inst.id) {
            debug!("Skipping instance {}: {}", inst.id, e);
            continue;
        }
        match best {
            Some(current) if inst.last_seen_at <= current.last_seen_at => {}
            _ => best = Some(inst),
        }
    }
    best.cloned()
}

/// Whether `inst` should be pruned: its daemon is gone or its proxy is
/// unhealthy.
///
/// A live daemon that has not recorded its HTTP port yet is still
/// starting and is not stale.
pub fn is_instance_stale(inst: &Instance, probe: &dyn HealthProbe) -> bool {
    if !process::is_alive(inst.daemon_pid) {
        return true;
    }
    inst.http_port != 0 && probe.check(inst.http_port, &inst.id).is_err()
}
