//! `tunnelkit proxy start|daemon|list|stop|prune|doctor`

use crate::cli::{ProxyArgs, ProxyCommands, ProxyDaemonArgs, ProxyStartArgs, ProxyStopArgs};
use crate::output;
use crate::profile_cmd::resolve_profile;
use chrono::Utc;
use std::fs::{self, File};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tunnelkit::ids::new_id;
use nix::sys::signal::Signal;
use tunnelkit::process::{is_alive, send_signal, terminate_pid};
use tunnelkit::runner::HEARTBEAT_INTERVAL;
use tunnelkit::{
    instance_statuses, prune_instances, run_daemon, FileDirectory, HealthClient, HealthProbe,
    Instance, InstanceDirectory, Result, StackOptions, TunnelkitError,
};

/// Slack on top of the daemon's own worst-case stack start.
const START_MARGIN: Duration = Duration::from_secs(10);
const START_POLL: Duration = Duration::from_millis(200);
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Run a proxy subcommand.
pub fn run_proxy(args: ProxyArgs, config: Option<PathBuf>, silent: bool) -> Result<()> {
    let directory = Arc::new(crate::open_directory(config)?);
    match args.command {
        ProxyCommands::Start(start_args) => run_start(directory, start_args, silent),
        ProxyCommands::Daemon(daemon_args) => run_daemon_cmd(directory, daemon_args),
        ProxyCommands::List => {
            let config = directory.load()?;
            let rows = instance_statuses(&config, &HealthClient::default());
            output::print_instances(&rows, &config.profiles);
            Ok(())
        }
        ProxyCommands::Stop(stop_args) => run_stop(&directory, stop_args, silent),
        ProxyCommands::Prune => {
            let removed = prune_instances(directory.as_ref(), &HealthClient::default())?;
            output::print_status(silent, &format!("pruned {} instance(s)", removed));
            Ok(())
        }
        ProxyCommands::Doctor => {
            run_doctor(&directory);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// start
// ---------------------------------------------------------------------------

fn run_start(directory: Arc<FileDirectory>, args: ProxyStartArgs, silent: bool) -> Result<()> {
    let config = directory.load()?;
    let profile = resolve_profile(&config, args.profile.as_deref())?;

    let now = Utc::now();
    let pending = Instance {
        id: new_id()?,
        profile_id: profile.id.clone(),
        http_port: 0,
        socks_port: 0,
        daemon_pid: 0,
        started_at: now,
        last_seen_at: now,
    };
    let instance_id = pending.id.clone();
    directory.record_instance(pending)?;

    if args.foreground {
        output::print_status(
            silent,
            &format!("running instance {} in the foreground", instance_id),
        );
        return run_daemon_cmd(directory, ProxyDaemonArgs { instance_id });
    }

    let log_path = instance_log_path(directory.dir(), &instance_id);
    let mut child = match spawn_daemon(directory.path(), &instance_id, &log_path) {
        Ok(child) => child,
        Err(e) => {
            directory.remove_instance(&instance_id)?;
            return Err(e);
        }
    };
    let pid = child_pid(&child)?;
    directory.update(&mut |cfg| {
        // the daemon may already have registered itself, or given up
        if let Some(inst) = cfg.instances.iter_mut().find(|i| i.id == instance_id) {
            if inst.daemon_pid == 0 {
                inst.daemon_pid = pid;
            }
        }
        Ok(())
    })?;
    info!("Spawned daemon pid {} for instance {}", pid, instance_id);

    let timeout = StackOptions::default().max_start_time() + START_MARGIN;
    let inst = await_daemon(
        directory.as_ref(),
        &HealthClient::default(),
        &mut child,
        &instance_id,
        &log_path,
        timeout,
    )?;
    output::print_status(
        silent,
        &format!(
            "instance {} serving http://127.0.0.1:{} (profile {}, log {})",
            inst.id,
            inst.http_port,
            profile.name,
            log_path.display()
        ),
    );
    println!("{}", inst.id);
    Ok(())
}

fn instance_log_path(config_dir: &Path, instance_id: &str) -> PathBuf {
    config_dir.join("instances").join(format!("{}.log", instance_id))
}

/// Re-execute this binary as `proxy daemon`, detached into its own
/// process group, with output going to `log_path`.
fn spawn_daemon(config_path: &Path, instance_id: &str, log_path: &Path) -> Result<Child> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| TunnelkitError::directory(parent, format!("create failed: {}", e)))?;
    }
    let log = File::create(log_path)
        .map_err(|e| TunnelkitError::directory(log_path, format!("create failed: {}", e)))?;
    let exe = std::env::current_exe()?;
    Command::new(&exe)
        .arg("--config")
        .arg(config_path)
        .args(["proxy", "daemon", "--instance-id", instance_id])
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .env("RUST_LOG", std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .process_group(0)
        .spawn()
        .map_err(|source| TunnelkitError::TargetSpawn {
            program: exe.display().to_string(),
            source,
        })
}

fn child_pid(child: &Child) -> Result<i32> {
    i32::try_from(child.id())
        .map_err(|_| TunnelkitError::InvalidConfig(format!("pid {} out of range", child.id())))
}

/// Wait for the spawned daemon to serve. If it does not within `timeout`,
/// or its record disappears, the daemon is stopped and its record removed
/// so nothing comes up after the failure is reported.
fn await_daemon(
    directory: &dyn InstanceDirectory,
    probe: &dyn HealthProbe,
    child: &mut Child,
    instance_id: &str,
    log_path: &Path,
    timeout: Duration,
) -> Result<Instance> {
    let result = wait_until_serving(directory, probe, instance_id, log_path, timeout);
    if result.is_err() {
        stop_child(child, STOP_GRACE);
        if let Err(e) = directory.remove_instance(instance_id) {
            warn!("Failed to remove instance {}: {}", instance_id, e);
        }
    }
    result
}

/// SIGINT, then SIGKILL after `grace`; the child is reaped either way.
fn stop_child(child: &mut Child, grace: Duration) {
    if let Ok(pid) = child_pid(child) {
        if let Err(e) = send_signal(pid, Signal::SIGINT) {
            debug!("SIGINT to daemon pid {}: {}", pid, e);
        }
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => std::thread::sleep(START_POLL),
            Err(e) => {
                debug!("Polling daemon: {}", e);
                break;
            }
        }
    }
    if let Err(e) = child.kill() {
        debug!("Killing daemon: {}", e);
    }
    if let Err(e) = child.wait() {
        debug!("Reaping daemon: {}", e);
    }
}

/// Poll the directory until the daemon has recorded real ports and its
/// proxy answers the health check.
fn wait_until_serving(
    directory: &dyn InstanceDirectory,
    probe: &dyn HealthProbe,
    instance_id: &str,
    log_path: &Path,
    timeout: Duration,
) -> Result<Instance> {
    let deadline = Instant::now() + timeout;
    loop {
        let config = directory.load()?;
        let Some(inst) = config.find_instance(instance_id) else {
            return Err(TunnelkitError::Tunnel(format!(
                "daemon for instance {} exited; see {}",
                instance_id,
                log_path.display()
            )));
        };
        if inst.http_port != 0 && probe.check(inst.http_port, &inst.id).is_ok() {
            return Ok(inst.clone());
        }
        if Instant::now() >= deadline {
            return Err(TunnelkitError::Tunnel(format!(
                "daemon for instance {} not ready after {:?}; see {}",
                instance_id,
                timeout,
                log_path.display()
            )));
        }
        std::thread::sleep(START_POLL);
    }
}

// ---------------------------------------------------------------------------
// daemon
// ---------------------------------------------------------------------------

fn run_daemon_cmd(directory: Arc<FileDirectory>, args: ProxyDaemonArgs) -> Result<()> {
    crate::block_on_cancellable(|mut cancel| async move {
        run_daemon(
            directory,
            &args.instance_id,
            StackOptions::default(),
            HEARTBEAT_INTERVAL,
            &mut cancel,
        )
        .await
    })
}

// ---------------------------------------------------------------------------
// stop
// ---------------------------------------------------------------------------

fn run_stop(directory: &FileDirectory, args: ProxyStopArgs, silent: bool) -> Result<()> {
    let config = directory.load()?;
    let inst = config
        .find_instance(&args.instance_id)
        .cloned()
        .ok_or_else(|| {
            TunnelkitError::InvalidConfig(format!("instance {} not found", args.instance_id))
        })?;

    if inst.daemon_pid > 0 && is_alive(inst.daemon_pid) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        rt.block_on(terminate_pid(inst.daemon_pid, STOP_GRACE))?;
        debug!("Daemon pid {} terminated", inst.daemon_pid);
    }
    // the daemon removes itself on a clean stop; this covers a killed one
    directory.remove_instance(&inst.id)?;
    output::print_status(silent, &format!("stopped instance {}", inst.id));
    Ok(())
}

// ---------------------------------------------------------------------------
// doctor
// ---------------------------------------------------------------------------

fn run_doctor(directory: &FileDirectory) {
    println!("tunnelkit doctor");
    match which::which("ssh") {
        Ok(path) => output::print_check(true, "ssh", &path.display().to_string()),
        Err(e) => output::print_check(false, "ssh", &format!("not found on PATH ({})", e)),
    }
    let dir = directory.dir();
    match check_writable(dir) {
        Ok(()) => output::print_check(true, "config dir", &dir.display().to_string()),
        Err(e) => output::print_check(false, "config dir", &format!("{}: {}", dir.display(), e)),
    }
    match directory.load() {
        Ok(config) => output::print_check(
            true,
            "config",
            &format!(
                "{} profile(s), {} instance(s)",
                config.profiles.len(),
                config.instances.len()
            ),
        ),
        Err(e) => output::print_check(false, "config", &e.to_string()),
    }
}

fn check_writable(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let probe = dir.join(format!(".doctor-{}", std::process::id()));
    fs::write(&probe, b"ok")?;
    fs::remove_file(&probe)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tunnelkit::HealthError;

    struct NeverHealthy;

    impl HealthProbe for NeverHealthy {
        fn check(&self, _port: u16, _instance_id: &str) -> std::result::Result<(), HealthError> {
            Err(HealthError::NotOk)
        }
    }

    #[test]
    fn test_instance_log_path() {
        assert_eq!(
            instance_log_path(Path::new("/cfg/tunnelkit"), "abc"),
            PathBuf::from("/cfg/tunnelkit/instances/abc.log")
        );
    }

    #[test]
    fn test_wait_reports_vanished_daemon() {
        let dir = tempdir().unwrap();
        let directory = FileDirectory::new(dir.path().join("config.json"));
        let err = wait_until_serving(
            &directory,
            &NeverHealthy,
            "gone",
            Path::new("/tmp/gone.log"),
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(err.to_string().contains("exited"), "{}", err);
    }

    #[test]
    fn test_unready_daemon_is_stopped_and_forgotten() {
        let dir = tempdir().unwrap();
        let directory = FileDirectory::new(dir.path().join("config.json"));
        // daemon stand-in that never answers health checks
        let mut child = Command::new("sleep").arg("60").spawn().unwrap();
        let now = Utc::now();
        directory
            .record_instance(Instance {
                id: "slow".to_string(),
                profile_id: "p1".to_string(),
                http_port: 1,
                socks_port: 2,
                daemon_pid: child_pid(&child).unwrap(),
                started_at: now,
                last_seen_at: now,
            })
            .unwrap();

        let err = await_daemon(
            &directory,
            &NeverHealthy,
            &mut child,
            "slow",
            Path::new("/tmp/slow.log"),
            Duration::from_millis(300),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not ready"), "{}", err);
        assert!(child.try_wait().unwrap().is_some());
        assert!(directory.load().unwrap().instances.is_empty());
    }

    #[test]
    fn test_start_timeout_outlasts_stack_start() {
        let opts = StackOptions::default();
        assert!(opts.max_start_time() + START_MARGIN > opts.socks_ready_timeout * 4);
    }

    #[test]
    fn test_stop_removes_dead_record() {
        let dir = tempdir().unwrap();
        let directory = FileDirectory::new(dir.path().join("config.json"));
        let now = Utc::now();
        directory
            .record_instance(Instance {
                id: "stale".to_string(),
                profile_id: "p1".to_string(),
                http_port: 8080,
                socks_port: 1080,
                daemon_pid: 0,
                started_at: now,
                last_seen_at: now,
            })
            .unwrap();

        run_stop(
            &directory,
            ProxyStopArgs {
                instance_id: "stale".to_string(),
            },
            true,
        )
        .unwrap();
        assert!(directory.load().unwrap().instances.is_empty());
        assert!(run_stop(
            &directory,
            ProxyStopArgs {
                instance_id: "stale".to_string(),
            },
            true,
        )
        .is_err());
    }

    #[test]
    fn test_check_writable() {
        let dir = tempdir().unwrap();
        check_writable(&dir.path().join("nested")).unwrap();
        assert!(dir.path().join("nested").is_dir());
    }
}
