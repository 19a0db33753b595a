//! Proxy stack: one SSH tunnel plus the local HTTP proxy dialing through it.
//!
//! [`Stack::start`] brings both up and only returns once the SOCKS port
//! accepts connections. A monitor task then restarts the tunnel on the same
//! port when it exits unexpectedly, and reports a fatal error once restarts
//! are exhausted or a restart fails.

use crate::cancel::{self, CancelReceiver};
use crate::directory::Profile;
use crate::error::{Result, TunnelkitError};
use crate::process::{ProcessLauncher, SystemLauncher};
use crate::tunnel::{Tunnel, TunnelConfig};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tunnelkit_proxy::{LocalProxy, ProxyOptions, Socks5Dialer};

/// Extra attempts with a fresh SOCKS port when the port was auto-selected.
const MAX_PORT_RETRIES: u32 = 3;

/// Tunables for [`Stack::start`].
#[derive(Clone)]
pub struct StackOptions {
    /// Listen address of the local HTTP proxy.
    pub http_listen_addr: String,
    /// SOCKS port for ssh; 0 picks a free one (and allows retries).
    pub socks_port: u16,
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    pub tunnel_stop_grace: Duration,
    pub socks_ready_timeout: Duration,
    pub socks_poll_interval: Duration,
    pub socks_probe_timeout: Duration,
    /// Timeout for one SOCKS dial made by the proxy.
    pub dial_timeout: Duration,
    pub batch_mode: bool,
    pub ssh_program: String,
    pub launcher: Arc<dyn ProcessLauncher>,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            http_listen_addr: "127.0.0.1:0".to_string(),
            socks_port: 0,
            max_restarts: 3,
            restart_backoff: Duration::from_secs(1),
            tunnel_stop_grace: Duration::from_secs(2),
            socks_ready_timeout: Duration::from_secs(30),
            socks_poll_interval: Duration::from_millis(100),
            socks_probe_timeout: Duration::from_millis(200),
            dial_timeout: tunnelkit_proxy::socks::DEFAULT_DIAL_TIMEOUT,
            batch_mode: true,
            ssh_program: "ssh".to_string(),
            launcher: Arc::new(SystemLauncher),
        }
    }
}

impl StackOptions {
    /// Upper bound on how long [`Stack::start`] takes to come up or fail
    /// with these options.
    pub fn max_start_time(&self) -> Duration {
        let attempts = if self.socks_port != 0 { 1 } else { MAX_PORT_RETRIES + 1 };
        let per_attempt =
            self.socks_ready_timeout + self.socks_probe_timeout + self.tunnel_stop_grace * 2;
        per_attempt * attempts
    }
}

impl std::fmt::Debug for StackOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackOptions")
            .field("http_listen_addr", &self.http_listen_addr)
            .field("socks_port", &self.socks_port)
            .field("max_restarts", &self.max_restarts)
            .field("restart_backoff", &self.restart_backoff)
            .field("socks_ready_timeout", &self.socks_ready_timeout)
            .field("ssh_program", &self.ssh_program)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of the tunnel monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Running,
    Restarting,
    Fatal,
    Stopped,
}

/// A running tunnel + proxy pair.
pub struct Stack {
    instance_id: String,
    profile: Profile,
    socks_port: u16,
    http_addr: SocketAddr,
    proxy: LocalProxy,
    tunnel: Arc<Mutex<Arc<Tunnel>>>,
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<MonitorState>,
    fatal_rx: Mutex<Option<mpsc::Receiver<String>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    tunnel_stop_grace: Duration,
}

/// What the monitor needs to restart tunnels.
struct MonitorCtx {
    profile: Profile,
    socks_port: u16,
    opts: StackOptions,
    tunnel: Arc<Mutex<Arc<Tunnel>>>,
    stop_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<MonitorState>,
    fatal_tx: mpsc::Sender<String>,
}

impl Stack {
    /// Start the proxy and tunnel for `profile`.
    ///
    /// Nothing is spawned or bound if the profile or instance id is
    /// invalid. On failure, or when `cancel` fires before the SOCKS port is
    /// ready, everything started so far is torn down.
    pub async fn start(
        profile: &Profile,
        instance_id: &str,
        opts: StackOptions,
        cancel: &mut CancelReceiver,
    ) -> Result<Self> {
        validate(profile, instance_id)?;

        let pinned = opts.socks_port != 0;
        let mut retries = 0;
        let (proxy, http_addr, tunnel, socks_port) = loop {
            if cancel::is_cancelled(cancel) {
                return Err(TunnelkitError::Cancelled);
            }
            let (socks_port, reservation) = if pinned {
                (opts.socks_port, None)
            } else {
                let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
                (listener.local_addr()?.port(), Some(listener))
            };

            match start_attempt(profile, instance_id, &opts, socks_port, reservation, cancel).await {
                Ok((proxy, http_addr, tunnel)) => break (proxy, http_addr, tunnel, socks_port),
                Err(e @ TunnelkitError::Tunnel(_)) if !pinned && retries < MAX_PORT_RETRIES => {
                    retries += 1;
                    warn!(
                        "SOCKS port {} not usable ({}), retrying with a new port ({}/{})",
                        socks_port, e, retries, MAX_PORT_RETRIES
                    );
                }
                Err(e) => return Err(e),
            }
        };
        info!(
            "Proxy stack {} up: http {} via SOCKS 127.0.0.1:{}",
            instance_id, http_addr, socks_port
        );

        let tunnel = Arc::new(Mutex::new(tunnel));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(MonitorState::Running);
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let tunnel_stop_grace = opts.tunnel_stop_grace;
        let ctx = MonitorCtx {
            profile: profile.clone(),
            socks_port,
            opts,
            tunnel: tunnel.clone(),
            stop_rx,
            state_tx,
            fatal_tx,
        };
        let monitor = tokio::spawn(monitor(ctx));

        Ok(Self {
            instance_id: instance_id.to_string(),
            profile: profile.clone(),
            socks_port,
            http_addr,
            proxy,
            tunnel,
            stop_tx,
            state_rx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
            monitor: Mutex::new(Some(monitor)),
            tunnel_stop_grace,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    pub fn http_port(&self) -> u16 {
        self.http_addr.port()
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// `http://127.0.0.1:<http_port>`
    pub fn http_proxy_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.http_port())
    }

    pub fn state(&self) -> MonitorState {
        *self.state_rx.borrow()
    }

    /// PID of the current ssh process.
    pub fn tunnel_pid(&self) -> Option<i32> {
        self.current_tunnel().pid()
    }

    /// Take the receiver for the stack's fatal error. Only the first call
    /// gets it; at most one error is ever delivered.
    pub fn take_fatal(&self) -> Option<mpsc::Receiver<String>> {
        self.fatal_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn current_tunnel(&self) -> Arc<Tunnel> {
        self.tunnel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop the tunnel and proxy. Idempotent.
    pub async fn close(&self) -> Result<()> {
        // the monitor must see "stopping" before the tunnel exits
        self.stop_tx.send_replace(true);

        let mut first_err = None;
        if let Err(e) = self.current_tunnel().stop(self.tunnel_stop_grace).await {
            first_err.get_or_insert(e);
        }

        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            if let Err(e) = monitor.await {
                debug!("Stack monitor ended abnormally: {}", e);
            }
        }

        // a restart may have raced with the first stop
        if let Err(e) = self.current_tunnel().stop(self.tunnel_stop_grace).await {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.proxy.close().await {
            first_err.get_or_insert(e.into());
        }
        debug!("Proxy stack {} closed", self.instance_id);
        first_err.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("instance_id", &self.instance_id)
            .field("socks_port", &self.socks_port)
            .field("http_addr", &self.http_addr)
            .field("state", &self.state())
            .finish()
    }
}

fn validate(profile: &Profile, instance_id: &str) -> Result<()> {
    if profile.host.trim().is_empty() {
        return Err(TunnelkitError::InvalidConfig("profile host is required".to_string()));
    }
    if profile.port == 0 {
        return Err(TunnelkitError::InvalidConfig("profile port is required".to_string()));
    }
    if profile.user.trim().is_empty() {
        return Err(TunnelkitError::InvalidConfig("profile user is required".to_string()));
    }
    if instance_id.trim().is_empty() {
        return Err(TunnelkitError::InvalidConfig("instance id is required".to_string()));
    }
    Ok(())
}

fn tunnel_config(profile: &Profile, socks_port: u16, batch_mode: bool) -> TunnelConfig {
    TunnelConfig {
        host: profile.host.clone(),
        port: profile.port,
        user: profile.user.clone(),
        socks_port,
        extra_args: profile.ssh_args.clone(),
        batch_mode,
    }
}

/// One attempt at bringing up proxy + tunnel on `socks_port`.
///
/// `reservation` holds the SOCKS port until the proxy is listening, so the
/// proxy's own ephemeral bind cannot land on it.
async fn start_attempt(
    profile: &Profile,
    instance_id: &str,
    opts: &StackOptions,
    socks_port: u16,
    reservation: Option<std::net::TcpListener>,
    cancel: &mut CancelReceiver,
) -> Result<(LocalProxy, SocketAddr, Arc<Tunnel>)> {
    let socks_addr = format!("127.0.0.1:{}", socks_port);
    let tunnel = Arc::new(Tunnel::new(
        opts.ssh_program.clone(),
        &tunnel_config(profile, socks_port, opts.batch_mode),
    )?);
    let dialer = Arc::new(Socks5Dialer::new(&socks_addr, opts.dial_timeout)?);
    let proxy = LocalProxy::new(dialer, ProxyOptions::for_instance(instance_id));
    let http_addr = proxy.start(&opts.http_listen_addr).await?;
    drop(reservation);

    if let Err(e) = tunnel.start(opts.launcher.as_ref()) {
        close_quietly(&proxy).await;
        return Err(e);
    }
    let ready = tokio::select! {
        ready = wait_for_socks(&socks_addr, &tunnel, opts) => ready,
        _ = cancel::cancelled(cancel) => {
            info!("Cancelled while waiting for SOCKS port {}", socks_port);
            Err(TunnelkitError::Cancelled)
        }
    };
    if let Err(e) = ready {
        if let Err(stop_err) = tunnel.stop(opts.tunnel_stop_grace).await {
            debug!("Stopping failed tunnel: {}", stop_err);
        }
        close_quietly(&proxy).await;
        return Err(e);
    }
    Ok((proxy, http_addr, tunnel))
}

async fn close_quietly(proxy: &LocalProxy) {
    if let Err(e) = proxy.close().await {
        debug!("Closing proxy after failed start: {}", e);
    }
}

/// Poll until `addr` accepts TCP connections.
///
/// Fails fast if the tunnel exits while waiting.
async fn wait_for_socks(addr: &str, tunnel: &Tunnel, opts: &StackOptions) -> Result<()> {
    let deadline = tokio::time::Instant::now() + opts.socks_ready_timeout;
    let mut last_err = String::from("no attempt made");
    loop {
        if tunnel.has_exited() {
            let exit = tunnel.wait().await?;
            return Err(TunnelkitError::Tunnel(format!(
                "ssh tunnel exited before SOCKS ready: {}",
                exit
            )));
        }
        match tokio::time::timeout(opts.socks_probe_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => last_err = e.to_string(),
            Err(_) => last_err = "connect timed out".to_string(),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(TunnelkitError::Tunnel(format!(
                "timeout waiting for {}: {}",
                addr, last_err
            )));
        }
        tokio::time::sleep(opts.socks_poll_interval).await;
    }
}

async fn monitor(mut ctx: MonitorCtx) {
    let mut restarts = 0u32;
    loop {
        let current = ctx
            .tunnel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let exit = tokio::select! {
            exit = current.wait() => exit,
            _ = cancel::cancelled(&mut ctx.stop_rx) => {
                ctx.state_tx.send_replace(MonitorState::Stopped);
                return;
            }
        };
        if cancel::is_cancelled(&ctx.stop_rx) {
            ctx.state_tx.send_replace(MonitorState::Stopped);
            return;
        }

        let exit = match exit {
            Ok(exit) => exit.to_string(),
            Err(e) => e.to_string(),
        };
        restarts += 1;
        if restarts > ctx.opts.max_restarts {
            fail(&ctx, format!("ssh tunnel exited too many times: {}", exit));
            return;
        }

        warn!(
            "SSH tunnel exited ({}), restarting in {:?} ({}/{})",
            exit, ctx.opts.restart_backoff, restarts, ctx.opts.max_restarts
        );
        ctx.state_tx.send_replace(MonitorState::Restarting);
        tokio::select! {
            _ = tokio::time::sleep(ctx.opts.restart_backoff) => {}
            _ = cancel::cancelled(&mut ctx.stop_rx) => {
                ctx.state_tx.send_replace(MonitorState::Stopped);
                return;
            }
        }

        // same port: the proxy's dialer is already bound to it
        let tunnel = match Tunnel::new(
            ctx.opts.ssh_program.clone(),
            &tunnel_config(&ctx.profile, ctx.socks_port, ctx.opts.batch_mode),
        ) {
            Ok(tunnel) => Arc::new(tunnel),
            Err(e) => {
                fail(&ctx, e.to_string());
                return;
            }
        };
        if let Err(e) = tunnel.start(ctx.opts.launcher.as_ref()) {
            fail(&ctx, e.to_string());
            return;
        }
        *ctx.tunnel.lock().unwrap_or_else(PoisonError::into_inner) = tunnel.clone();

        let socks_addr = format!("127.0.0.1:{}", ctx.socks_port);
        let ready = tokio::select! {
            ready = wait_for_socks(&socks_addr, &tunnel, &ctx.opts) => ready,
            _ = cancel::cancelled(&mut ctx.stop_rx) => {
                ctx.state_tx.send_replace(MonitorState::Stopped);
                return;
            }
        };
        if let Err(e) = ready {
            if let Err(stop_err) = tunnel.stop(ctx.opts.tunnel_stop_grace).await {
                debug!("Stopping failed tunnel: {}", stop_err);
            }
            fail(&ctx, e.to_string());
            return;
        }

        info!("SSH tunnel restarted on SOCKS port {}", ctx.socks_port);
        restarts = 0;
        ctx.state_tx.send_replace(MonitorState::Running);
    }
}

fn fail(ctx: &MonitorCtx, reason: String) {
    error!("Proxy stack failed: {}", reason);
    ctx.state_tx.send_replace(MonitorState::Fatal);
    if ctx.fatal_tx.try_send(reason).is_err() {
        debug!("Fatal error already pending or receiver gone");
    }
}
