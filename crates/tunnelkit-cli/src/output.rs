//! CLI output styling for tunnelkit

use chrono::{DateTime, Utc};
use colored::{ColoredString, Colorize};
use tunnelkit::{Instance, InstanceStatus, Profile};

/// Status line on stderr, unless silenced.
pub fn print_status(silent: bool, message: &str) {
    if silent {
        return;
    }
    eprintln!("{} {}", "tunnelkit:".truecolor(204, 102, 0).bold(), message);
}

pub fn print_warning(silent: bool, message: &str) {
    if silent {
        return;
    }
    eprintln!("{}", format!("WARNING: {}", message).yellow());
}

pub fn print_profiles(profiles: &[Profile]) {
    if profiles.is_empty() {
        eprintln!("No profiles. Add one with `tunnelkit profile add --name <NAME> --host <HOST>`.");
        return;
    }
    for profile in profiles {
        println!(
            "{}  {}  {}@{}:{}",
            profile.id.truecolor(150, 150, 150),
            profile.name.white().bold(),
            profile.user,
            profile.host,
            profile.port
        );
        if !profile.ssh_args.is_empty() {
            println!("    ssh args: {}", profile.ssh_args.join(" "));
        }
    }
}

pub fn print_instances(rows: &[(Instance, InstanceStatus)], profiles: &[Profile]) {
    if rows.is_empty() {
        eprintln!("No proxy instances registered.");
        return;
    }
    for (inst, status) in rows {
        let profile = profiles
            .iter()
            .find(|p| p.id == inst.profile_id)
            .map_or(inst.profile_id.as_str(), |p| p.name.as_str());
        println!(
            "{}  [{}]  profile {}  http 127.0.0.1:{}  socks {}  pid {}  seen {}",
            inst.id.white(),
            status_label(*status),
            profile,
            inst.http_port,
            inst.socks_port,
            inst.daemon_pid,
            ago(inst.last_seen_at).truecolor(150, 150, 150)
        );
    }
}

fn status_label(status: InstanceStatus) -> ColoredString {
    match status {
        InstanceStatus::Alive => status.to_string().green(),
        InstanceStatus::Dead => status.to_string().red(),
        InstanceStatus::Starting => status.to_string().cyan(),
        InstanceStatus::Unhealthy => status.to_string().yellow(),
    }
}

/// Coarse "N units ago" rendering.
fn ago(at: DateTime<Utc>) -> String {
    let secs = (Utc::now() - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86400),
    }
}

/// One line of `proxy doctor` output.
pub fn print_check(ok: bool, what: &str, detail: &str) {
    let mark = if ok { "ok".green() } else { "FAIL".red() };
    println!("  [{}] {}: {}", mark, what, detail);
}
