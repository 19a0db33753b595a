//! OS process helpers: liveness checks, signals and the launcher seam
//! used to spawn SSH.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::debug;

/// Poll interval while waiting for an unrelated process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Spawns external processes.
///
/// Stacks and tunnels never call `Command::spawn` directly; tests inject a
/// launcher that runs a stand-in for `ssh`.
pub trait ProcessLauncher: Send + Sync {
    /// Spawn `program` with `args` and return the running child.
    fn launch(&self, program: &str, args: &[String]) -> io::Result<Child>;
}

/// Launches real processes.
///
/// stdin is closed and stdout is redirected to our stderr so SSH
/// diagnostics never mix with the target command's stdout. The child gets
/// its own process group, so a terminal Ctrl-C reaches the stack owner
/// first and the tunnel is torn down in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, program: &str, args: &[String]) -> io::Result<Child> {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(io::stderr()))
            .stderr(Stdio::inherit())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
    }
}

/// Check if a process with the given PID is currently running.
///
/// Non-positive PIDs are never alive; `kill(pid, 0)` on them would address
/// process groups.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(nix::errno::Errno::EPERM) => true,
        _ => true,
    }
}

/// Send `signal` to `pid`.
pub fn send_signal(pid: i32, signal: Signal) -> io::Result<()> {
    if pid <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {}", pid),
        ));
    }
    kill(Pid::from_raw(pid), signal).map_err(io::Error::from)
}

/// Stop a process we did not spawn: SIGINT, wait up to `grace`, then
/// SIGKILL.
///
/// Returns once the process is gone or `grace` has passed twice.
pub async fn terminate_pid(pid: i32, grace: Duration) -> io::Result<()> {
    if !is_alive(pid) {
        return Ok(());
    }
    send_signal(pid, Signal::SIGINT)?;
    if wait_for_exit(pid, grace).await {
        return Ok(());
    }
    debug!("pid {} ignored SIGINT for {:?}, sending SIGKILL", pid, grace);
    if let Err(e) = send_signal(pid, Signal::SIGKILL) {
        if e.raw_os_error() != Some(nix::errno::Errno::ESRCH as i32) {
            return Err(e);
        }
    }
    if wait_for_exit(pid, grace).await {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("pid {} still running after SIGKILL", pid),
        ))
    }
}

async fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(std::process::id() as i32));
    }

    #[test]
    fn test_non_positive_pids_are_dead() {
        assert!(!is_alive(0));
        assert!(!is_alive(-1));
        assert!(send_signal(0, Signal::SIGINT).is_err());
    }

    #[tokio::test]
    async fn test_reaped_child_is_dead() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap() as i32;
        child.wait().await.unwrap();
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_terminate_pid_dead_is_noop() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap() as i32;
        child.wait().await.unwrap();
        terminate_pid(pid, Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_system_launcher_spawns() {
        let mut child = SystemLauncher
            .launch("sh", &["-c".to_string(), "exit 3".to_string()])
            .unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
    }
}
