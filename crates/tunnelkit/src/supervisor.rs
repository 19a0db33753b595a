//! Target-process supervisor.
//!
//! Runs the user's command with the proxy environment applied, tees its
//! output to the terminal and a bounded capture, and terminates it when the
//! proxy becomes unhealthy, the stack reports a fatal error, or the caller
//! cancels. [`run_target_with_fallback`] adds the retry policy for targets
//! that reject yolo arguments and records crash signatures.

use crate::cancel::{self, CancelReceiver};
use crate::capture::{self, SharedBuffer, DEFAULT_CAPTURE_LIMIT};
use crate::env;
use crate::error::{Result, TunnelkitError};
use crate::health::HealthError;
use crate::process;
use crate::signature::{
    format_failure_reason, is_crash_signature, is_unsupported_flag_failure, strip_yolo_args,
};
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on waiting for tee tasks after the child exits. A
/// grandchild that inherited the pipes can keep them open indefinitely.
const TEE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Blocking health probe of the proxy the target is using.
pub type HealthCheck = Arc<dyn Fn() -> std::result::Result<(), HealthError> + Send + Sync>;

/// Callback invoked once when the yolo fallback fires.
pub type FallbackHook = Box<dyn FnMut() -> Result<()> + Send>;

/// Receives a short failure reason when a target run looks like a crash.
pub trait CrashRecorder: Send + Sync {
    fn record_crash(&self, reason: &str) -> Result<()>;
}

/// How to run a target command.
pub struct TargetOptions {
    /// Working directory for the child; inherits ours when `None`.
    pub cwd: Option<PathBuf>,
    /// Variables added after the proxy variables.
    pub extra_env: Vec<(String, String)>,
    /// Apply `HTTP(S)_PROXY` / `NO_PROXY` for the proxy URL.
    pub use_proxy: bool,
    /// Leave stdout attached to the terminal (only stderr is captured).
    pub preserve_tty: bool,
    /// The command carries yolo arguments that may be stripped on retry.
    pub yolo_enabled: bool,
    pub health_interval: Duration,
    /// Consecutive failed probes before the target is terminated.
    pub health_failure_limit: u32,
    /// Time between SIGINT and SIGKILL.
    pub terminate_grace: Duration,
    /// Bytes of output kept for failure matching.
    pub capture_limit: usize,
    pub on_fallback: Option<FallbackHook>,
    pub crash_recorder: Option<Arc<dyn CrashRecorder>>,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            extra_env: Vec::new(),
            use_proxy: true,
            preserve_tty: false,
            yolo_enabled: false,
            health_interval: Duration::from_secs(5),
            health_failure_limit: 3,
            terminate_grace: Duration::from_secs(2),
            capture_limit: DEFAULT_CAPTURE_LIMIT,
            on_fallback: None,
            crash_recorder: None,
        }
    }
}

impl std::fmt::Debug for TargetOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetOptions")
            .field("cwd", &self.cwd)
            .field("use_proxy", &self.use_proxy)
            .field("preserve_tty", &self.preserve_tty)
            .field("yolo_enabled", &self.yolo_enabled)
            .field("health_interval", &self.health_interval)
            .field("health_failure_limit", &self.health_failure_limit)
            .field("terminate_grace", &self.terminate_grace)
            .finish_non_exhaustive()
    }
}

/// Result of one target run plus the captured output tail.
#[derive(Debug)]
pub struct TargetRun {
    pub result: Result<()>,
    pub output: String,
}

/// The proxy the target runs against.
#[derive(Clone)]
pub struct ProxyContext {
    /// `http://127.0.0.1:<port>`
    pub url: String,
    pub health: Option<HealthCheck>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Initial,
    Retried,
}

/// Run `cmd` once.
///
/// `fatal` delivers stack failures; `None` means the target is not tied to
/// a stack this process owns.
pub async fn run_target_once(
    cmd: &[String],
    proxy: Option<&ProxyContext>,
    fatal: Option<&mut mpsc::Receiver<String>>,
    cancel: &mut CancelReceiver,
    opts: &TargetOptions,
) -> TargetRun {
    let capture = capture::shared(opts.capture_limit);
    let result = supervise(cmd, proxy, fatal, cancel, opts, &capture).await;
    TargetRun {
        result,
        output: capture::snapshot(&capture),
    }
}

async fn supervise(
    cmd: &[String],
    proxy: Option<&ProxyContext>,
    mut fatal: Option<&mut mpsc::Receiver<String>>,
    cancel: &mut CancelReceiver,
    opts: &TargetOptions,
    capture: &SharedBuffer,
) -> Result<()> {
    let (program, args) = cmd
        .split_first()
        .ok_or_else(|| TunnelkitError::InvalidConfig("no command to run".to_string()))?;
    if cancel::is_cancelled(cancel) {
        return Err(TunnelkitError::Cancelled);
    }

    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::inherit()).stderr(Stdio::piped());
    if opts.preserve_tty {
        command.stdout(Stdio::inherit());
    } else {
        command.stdout(Stdio::piped());
    }
    if let Some(cwd) = &opts.cwd {
        command.current_dir(cwd);
    }
    if opts.use_proxy {
        if let Some(proxy) = proxy {
            command.envs(env::proxy_vars_from_env(&proxy.url));
        }
    }
    command.envs(opts.extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    command.kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| TunnelkitError::TargetSpawn {
        program: program.clone(),
        source,
    })?;
    info!("Started target {} (pid {:?})", program, child.id());

    let mut tees = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        tees.push(spawn_tee(stdout, tokio::io::stdout(), capture.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tees.push(spawn_tee(stderr, tokio::io::stderr(), capture.clone()));
    }

    let health = proxy.and_then(|p| p.health.clone());
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + opts.health_interval,
        opts.health_interval,
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    let result = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(TunnelkitError::TargetExit(status)),
                    Err(e) => Err(TunnelkitError::Io(e)),
                };
            }
            msg = recv_fatal(&mut fatal) => {
                match msg {
                    Some(reason) => {
                        warn!("Proxy stack failed, terminating target: {}", reason);
                        terminate(&mut child, opts.terminate_grace).await;
                        break Err(TunnelkitError::TargetStackFailed(reason));
                    }
                    None => {
                        debug!("Stack fatal channel closed");
                        fatal = None;
                    }
                }
            }
            _ = cancel::cancelled(cancel) => {
                info!("Cancelled, terminating target");
                terminate(&mut child, opts.terminate_grace).await;
                break Err(TunnelkitError::Cancelled);
            }
            _ = ticker.tick(), if health.is_some() => {
                let Some(check) = health.clone() else { continue };
                let outcome = tokio::task::spawn_blocking(move || check())
                    .await
                    .unwrap_or_else(|e| Err(HealthError::Request(format!("health task failed: {}", e))));
                match outcome {
                    Ok(()) => consecutive_failures = 0,
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(
                            "Proxy health check failed ({}/{}): {}",
                            consecutive_failures, opts.health_failure_limit, e
                        );
                        if consecutive_failures >= opts.health_failure_limit {
                            terminate(&mut child, opts.terminate_grace).await;
                            break Err(TunnelkitError::ProxyUnhealthy(e));
                        }
                    }
                }
            }
        }
    };

    drain_tees(tees).await;
    result
}

async fn recv_fatal(fatal: &mut Option<&mut mpsc::Receiver<String>>) -> Option<String> {
    match fatal {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// SIGINT, wait `grace`, then SIGKILL. Always reaps the child.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        if let Err(e) = process::send_signal(pid as i32, Signal::SIGINT) {
            debug!("SIGINT to target (pid {}) failed: {}", pid, e);
        }
    }
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    warn!("Target did not exit within {:?}, killing", grace);
    if let Err(e) = child.start_kill() {
        debug!("SIGKILL to target failed: {}", e);
    }
    if let Err(e) = child.wait().await {
        debug!("Reaping target failed: {}", e);
    }
}

fn spawn_tee<R, W>(mut reader: R, mut writer: W, capture: SharedBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            capture
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write(&chunk[..n]);
            if writer.write_all(&chunk[..n]).await.is_ok() {
                let _ = writer.flush().await;
            }
        }
    })
}

async fn drain_tees(tees: Vec<JoinHandle<()>>) {
    for mut tee in tees {
        if tokio::time::timeout(TEE_DRAIN_TIMEOUT, &mut tee).await.is_err() {
            debug!("Output pipe still open after target exit, detaching");
            tee.abort();
        }
    }
}

/// Run `cmd`, retrying once without yolo arguments if the target rejects
/// them, and recording crash signatures.
pub async fn run_target_with_fallback(
    cmd: Vec<String>,
    proxy: Option<&ProxyContext>,
    mut fatal: Option<&mut mpsc::Receiver<String>>,
    cancel: &mut CancelReceiver,
    opts: &mut TargetOptions,
) -> Result<()> {
    let mut cmd = cmd;
    let mut attempt = Attempt::Initial;
    loop {
        let run = run_target_once(&cmd, proxy, fatal.as_deref_mut(), cancel, opts).await;
        let err = match run.result {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if attempt == Attempt::Initial
            && opts.yolo_enabled
            && matches!(err, TunnelkitError::TargetExit(_))
            && is_unsupported_flag_failure(&run.output)
        {
            warn!("Target rejected yolo arguments, retrying without them");
            if let Some(hook) = opts.on_fallback.as_mut() {
                if let Err(e) = hook() {
                    warn!("Failed to persist yolo fallback: {}", e);
                }
            }
            cmd = strip_yolo_args(&cmd);
            opts.yolo_enabled = false;
            attempt = Attempt::Retried;
            continue;
        }

        if let Some(recorder) = &opts.crash_recorder {
            if is_crash_signature(&err, &run.output) {
                let reason = format_failure_reason(Some(&err), &run.output);
                if let Err(e) = recorder.record_crash(&reason) {
                    warn!("Failed to record target crash: {}", e);
                }
            }
        }
        return Err(err);
    }
}
