//! SSH dynamic-forward tunnel (`ssh -N -D 127.0.0.1:<port>`).
//!
//! A [`Tunnel`] is spawned through a [`ProcessLauncher`]. A waiter task owns
//! the child and publishes its exit into a `watch` channel, so any number of
//! callers can `wait()` or poll `has_exited()` without contending for the
//! child handle.

use crate::error::{Result, TunnelkitError};
use crate::process::{self, ProcessLauncher};
use nix::sys::signal::Signal;
use std::fmt;
use std::process::ExitStatus;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Connection parameters for one SSH tunnel.
#[derive(Debug, Clone, Default)]
pub struct TunnelConfig {
    pub host: String,
    pub port: u16,
    /// Login user; empty means "let ssh decide".
    pub user: String,
    /// Local port for the SOCKS listener (`-D 127.0.0.1:<socks_port>`).
    pub socks_port: u16,
    /// Extra arguments inserted before the destination.
    pub extra_args: Vec<String>,
    /// Pass `-o BatchMode=yes` so ssh never prompts.
    pub batch_mode: bool,
}

/// Build the ssh argument vector for `config`.
///
/// Fails before anything is spawned if the host is empty or a port is zero.
pub fn build_args(config: &TunnelConfig) -> Result<Vec<String>> {
    let host = config.host.trim();
    if host.is_empty() {
        return Err(TunnelkitError::InvalidConfig(
            "tunnel host is required".to_string(),
        ));
    }
    if config.port == 0 {
        return Err(TunnelkitError::InvalidConfig(
            "tunnel port must be non-zero".to_string(),
        ));
    }
    if config.socks_port == 0 {
        return Err(TunnelkitError::InvalidConfig(
            "SOCKS port must be non-zero".to_string(),
        ));
    }

    let mut args: Vec<String> = [
        "-N",
        "-o",
        "ExitOnForwardFailure=yes",
        "-o",
        "ConnectTimeout=15",
        "-o",
        "ServerAliveInterval=15",
        "-o",
        "ServerAliveCountMax=3",
        "-o",
        "TCPKeepAlive=yes",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.push("-p".to_string());
    args.push(config.port.to_string());
    args.push("-D".to_string());
    args.push(format!("127.0.0.1:{}", config.socks_port));
    if config.batch_mode {
        args.push("-o".to_string());
        args.push("BatchMode=yes".to_string());
    }
    args.extend(config.extra_args.iter().cloned());

    let user = config.user.trim();
    if user.is_empty() {
        args.push(host.to_string());
    } else {
        args.push(format!("{}@{}", user, host));
    }
    Ok(args)
}

/// How a tunnel process ended.
#[derive(Debug, Clone)]
pub enum TunnelExit {
    Exited(ExitStatus),
    /// Waiting on the child failed; the process state is unknown.
    WaitFailed(String),
}

impl TunnelExit {
    /// Whether the process exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        matches!(self, TunnelExit::Exited(status) if status.success())
    }
}

impl fmt::Display for TunnelExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelExit::Exited(status) => write!(f, "{}", status),
            TunnelExit::WaitFailed(reason) => write!(f, "wait failed: {}", reason),
        }
    }
}

#[derive(Clone)]
struct Started {
    pid: i32,
    exit_rx: watch::Receiver<Option<TunnelExit>>,
}

/// One SSH tunnel process.
pub struct Tunnel {
    program: String,
    args: Vec<String>,
    socks_port: u16,
    started: Mutex<Option<Started>>,
}

impl Tunnel {
    /// Validate `config` and prepare (but do not spawn) the tunnel.
    pub fn new(program: impl Into<String>, config: &TunnelConfig) -> Result<Self> {
        let args = build_args(config)?;
        Ok(Self {
            program: program.into(),
            args,
            socks_port: config.socks_port,
            started: Mutex::new(None),
        })
    }

    /// Arguments passed to the ssh program.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    /// Spawn the ssh process. Fails if already started.
    pub fn start(&self, launcher: &dyn ProcessLauncher) -> Result<()> {
        let mut started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
        if started.is_some() {
            return Err(TunnelkitError::Tunnel("tunnel already started".to_string()));
        }

        let mut child =
            launcher
                .launch(&self.program, &self.args)
                .map_err(|source| TunnelkitError::TunnelSpawn {
                    program: self.program.clone(),
                    source,
                })?;
        let pid = match child.id() {
            Some(pid) => pid as i32,
            None => {
                return Err(TunnelkitError::Tunnel(
                    "tunnel exited before its pid was known".to_string(),
                ))
            }
        };
        info!(
            "SSH tunnel started (pid {}, SOCKS 127.0.0.1:{})",
            pid, self.socks_port
        );

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => TunnelExit::Exited(status),
                Err(e) => TunnelExit::WaitFailed(e.to_string()),
            };
            info!("SSH tunnel (pid {}) exited: {}", pid, exit);
            exit_tx.send_replace(Some(exit));
        });

        *started = Some(Started { pid, exit_rx });
        Ok(())
    }

    fn started(&self) -> Option<Started> {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// PID of the ssh process, if started.
    pub fn pid(&self) -> Option<i32> {
        self.started().map(|s| s.pid)
    }

    /// Whether the process has exited. `false` if never started.
    pub fn has_exited(&self) -> bool {
        self.started()
            .map(|s| s.exit_rx.borrow().is_some())
            .unwrap_or(false)
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> Result<TunnelExit> {
        let Some(started) = self.started() else {
            return Err(TunnelkitError::Tunnel("tunnel not started".to_string()));
        };
        let mut exit_rx = started.exit_rx;
        let exit = exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TunnelkitError::Tunnel("tunnel exit watcher ended".to_string()))?;
        exit.clone()
            .ok_or_else(|| TunnelkitError::Tunnel("tunnel exit unknown".to_string()))
    }

    /// Stop the tunnel: SIGINT, wait up to `grace`, then SIGKILL.
    ///
    /// No-op when never started or already exited.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        let Some(started) = self.started() else {
            return Ok(());
        };
        if started.exit_rx.borrow().is_some() {
            return Ok(());
        }

        if let Err(e) = process::send_signal(started.pid, Signal::SIGINT) {
            debug!("SIGINT to SSH tunnel (pid {}) failed: {}", started.pid, e);
        }
        if tokio::time::timeout(grace, self.wait()).await.is_ok() {
            return Ok(());
        }

        warn!(
            "SSH tunnel (pid {}) did not exit within {:?}, killing",
            started.pid, grace
        );
        if let Err(e) = process::send_signal(started.pid, Signal::SIGKILL) {
            debug!("SIGKILL to SSH tunnel (pid {}) failed: {}", started.pid, e);
        }
        self.wait().await?;
        Ok(())
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("program", &self.program)
            .field("socks_port", &self.socks_port)
            .field("pid", &self.pid())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::process::{Child, Command};

    /// Launcher that ignores the ssh arguments and runs a shell script.
    pub(crate) struct ScriptLauncher {
        pub script: String,
        pub launches: Arc<AtomicUsize>,
    }

    impl ScriptLauncher {
        pub(crate) fn new(script: &str) -> Self {
            Self {
                script: script.to_string(),
                launches: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl ProcessLauncher for ScriptLauncher {
        fn launch(&self, _program: &str, _args: &[String]) -> io::Result<Child> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Command::new("sh")
                .arg("-c")
                .arg(&self.script)
                .kill_on_drop(true)
                .spawn()
        }
    }

    fn config() -> TunnelConfig {
        TunnelConfig {
            host: "bastion.example".to_string(),
            port: 2222,
            user: "alice".to_string(),
            socks_port: 1080,
            extra_args: vec!["-i".to_string(), "/tmp/key".to_string()],
            batch_mode: true,
        }
    }

    #[test]
    fn test_build_args_order() {
        let args = build_args(&config()).unwrap();
        assert_eq!(args[0], "-N");
        let joined = args.join(" ");
        assert!(joined.contains("-o ExitOnForwardFailure=yes"));
        assert!(joined.contains("-o ServerAliveCountMax=3"));
        assert!(joined.contains("-p 2222 -D 127.0.0.1:1080 -o BatchMode=yes -i /tmp/key"));
        assert_eq!(args.last().unwrap(), "alice@bastion.example");
    }

    #[test]
    fn test_build_args_without_user_or_batch() {
        let mut cfg = config();
        cfg.user = String::new();
        cfg.batch_mode = false;
        let args = build_args(&cfg).unwrap();
        assert_eq!(args.last().unwrap(), "bastion.example");
        assert!(!args.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn test_build_args_rejects_bad_input() {
        let mut cfg = config();
        cfg.host = "  ".to_string();
        assert!(build_args(&cfg).is_err());

        let mut cfg = config();
        cfg.port = 0;
        assert!(build_args(&cfg).is_err());

        let mut cfg = config();
        cfg.socks_port = 0;
        assert!(build_args(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_never_launches() {
        let mut cfg = config();
        cfg.host.clear();
        assert!(Tunnel::new("ssh", &cfg).is_err());
    }

    #[tokio::test]
    async fn test_start_wait_and_double_start() {
        let launcher = ScriptLauncher::new("exit 7");
        let tunnel = Tunnel::new("ssh", &config()).unwrap();
        tunnel.start(&launcher).unwrap();
        assert!(tunnel.pid().is_some());
        assert!(tunnel.start(&launcher).is_err());

        match tunnel.wait().await.unwrap() {
            TunnelExit::Exited(status) => assert_eq!(status.code(), Some(7)),
            other => panic!("unexpected exit: {}", other),
        }
        assert!(tunnel.has_exited());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        struct Missing;
        impl ProcessLauncher for Missing {
            fn launch(&self, program: &str, args: &[String]) -> io::Result<Child> {
                Command::new(program).args(args).spawn()
            }
        }
        let tunnel = Tunnel::new("/nonexistent/ssh-binary", &config()).unwrap();
        let err = tunnel.start(&Missing).unwrap_err();
        assert!(matches!(err, TunnelkitError::TunnelSpawn { .. }));
    }

    #[tokio::test]
    async fn test_stop_never_started_is_noop() {
        let tunnel = Tunnel::new("ssh", &config()).unwrap();
        tunnel.stop(Duration::from_millis(10)).await.unwrap();
        assert!(!tunnel.has_exited());
        assert!(tunnel.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_interrupts() {
        let launcher = ScriptLauncher::new("exec sleep 30");
        let tunnel = Tunnel::new("ssh", &config()).unwrap();
        tunnel.start(&launcher).unwrap();
        tunnel.stop(Duration::from_secs(2)).await.unwrap();
        assert!(tunnel.has_exited());
        // second stop is a no-op
        tunnel.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let launcher = ScriptLauncher::new("trap '' INT; while true; do sleep 0.05; done");
        let tunnel = Tunnel::new("ssh", &config()).unwrap();
        tunnel.start(&launcher).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        tunnel.stop(Duration::from_millis(300)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        match tunnel.wait().await.unwrap() {
            TunnelExit::Exited(status) => {
                use std::os::unix::process::ExitStatusExt;
                assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
            }
            other => panic!("unexpected exit: {}", other),
        }
    }
}
