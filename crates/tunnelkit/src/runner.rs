//! Run a target command against a profile, reusing a healthy instance when
//! one is registered and starting a fresh [`Stack`] otherwise.

use crate::cancel::{self, CancelReceiver};
use crate::directory::{Config, Instance, InstanceDirectory, Profile};
use crate::error::{Result, TunnelkitError};
use crate::health::HealthProbe;
use crate::ids;
use crate::reuse::find_reusable_instance;
use crate::stack::{Stack, StackOptions};
use crate::supervisor::{run_target_with_fallback, HealthCheck, ProxyContext, TargetOptions};
use chrono::Utc;
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often a running stack's owner refreshes `last_seen_at`.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Everything needed to run targets against proxy instances.
pub struct Runner {
    directory: Arc<dyn InstanceDirectory>,
    probe: Arc<dyn HealthProbe>,
    stack_options: StackOptions,
    heartbeat_interval: Duration,
}

impl Runner {
    pub fn new(directory: Arc<dyn InstanceDirectory>, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            directory,
            probe,
            stack_options: StackOptions::default(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_stack_options(mut self, options: StackOptions) -> Self {
        self.stack_options = options;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Run `cmd` against `profile`.
    ///
    /// `cached` is the caller's snapshot of the directory. If it has no
    /// reusable instance the directory is loaded once more before a new
    /// stack is started, to pick up instances other processes registered
    /// in the meantime.
    pub async fn run(
        &self,
        cached: &Config,
        profile: &Profile,
        cmd: Vec<String>,
        opts: &mut TargetOptions,
        cancel: &mut CancelReceiver,
    ) -> Result<()> {
        if let Some(inst) = self.select(cached.instances.clone(), &profile.id).await? {
            return self.run_with_instance(&inst, cmd, opts, cancel).await;
        }
        let fresh = self.directory.load()?;
        if let Some(inst) = self.select(fresh.instances, &profile.id).await? {
            return self.run_with_instance(&inst, cmd, opts, cancel).await;
        }
        self.run_with_new_stack(profile, cmd, opts, cancel).await
    }

    /// Run `cmd` against an instance owned by another process.
    pub async fn run_with_instance(
        &self,
        inst: &Instance,
        cmd: Vec<String>,
        opts: &mut TargetOptions,
        cancel: &mut CancelReceiver,
    ) -> Result<()> {
        info!(
            "Reusing instance {} on http port {}",
            inst.id, inst.http_port
        );
        let proxy = ProxyContext {
            url: format!("http://127.0.0.1:{}", inst.http_port),
            health: Some(self.health_check(inst.http_port, &inst.id)),
        };
        run_target_with_fallback(cmd, Some(&proxy), None, cancel, opts).await
    }

    /// Start a stack for `profile`, register it, and run `cmd` against it.
    ///
    /// The instance is removed and the stack closed however the target
    /// ends.
    pub async fn run_with_new_stack(
        &self,
        profile: &Profile,
        cmd: Vec<String>,
        opts: &mut TargetOptions,
        cancel: &mut CancelReceiver,
    ) -> Result<()> {
        let instance_id = ids::new_id()?;
        let stack = Stack::start(profile, &instance_id, self.stack_options.clone(), cancel).await?;

        let now = Utc::now();
        let instance = Instance {
            id: instance_id.clone(),
            profile_id: profile.id.clone(),
            http_port: stack.http_port(),
            socks_port: stack.socks_port(),
            daemon_pid: Pid::this().as_raw(),
            started_at: now,
            last_seen_at: now,
        };
        if let Err(e) = self.directory.record_instance(instance) {
            close_stack(&stack).await;
            return Err(e);
        }

        let heartbeat = Heartbeat::spawn(
            self.directory.clone(),
            instance_id.clone(),
            self.heartbeat_interval,
        );
        let mut fatal = stack.take_fatal();
        let proxy = ProxyContext {
            url: stack.http_proxy_url(),
            health: Some(self.health_check(stack.http_port(), &instance_id)),
        };
        let result = run_target_with_fallback(cmd, Some(&proxy), fatal.as_mut(), cancel, opts).await;

        heartbeat.stop().await;
        if let Err(e) = self.directory.remove_instance(&instance_id) {
            warn!("Failed to remove instance {}: {}", instance_id, e);
        }
        close_stack(&stack).await;
        result
    }

    async fn select(&self, instances: Vec<Instance>, profile_id: &str) -> Result<Option<Instance>> {
        let probe = self.probe.clone();
        let profile_id = profile_id.to_string();
        tokio::task::spawn_blocking(move || {
            find_reusable_instance(&instances, &profile_id, probe.as_ref())
        })
        .await
        .map_err(|e| TunnelkitError::Io(std::io::Error::other(e)))
    }

    fn health_check(&self, port: u16, instance_id: &str) -> HealthCheck {
        let probe = self.probe.clone();
        let instance_id = instance_id.to_string();
        Arc::new(move || probe.check(port, &instance_id))
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("directory", &self.directory.path())
            .field("stack_options", &self.stack_options)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

async fn close_stack(stack: &Stack) {
    if let Err(e) = stack.close().await {
        warn!("Failed to close proxy stack {}: {}", stack.instance_id(), e);
    }
}

/// Background task advancing an instance's `last_seen_at`.
pub(crate) struct Heartbeat {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub(crate) fn spawn(
        directory: Arc<dyn InstanceDirectory>,
        instance_id: String,
        interval: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel::cancelled(&mut stop_rx) => return,
                }
                let directory = directory.clone();
                let id = instance_id.clone();
                let beat =
                    tokio::task::spawn_blocking(move || directory.heartbeat(&id, Utc::now())).await;
                match beat {
                    Ok(Ok(())) => debug!("Heartbeat for instance {}", instance_id),
                    Ok(Err(e)) => warn!("Heartbeat for instance {} failed: {}", instance_id, e),
                    Err(e) => warn!("Heartbeat task for instance {} failed: {}", instance_id, e),
                }
            }
        });
        Self { stop_tx, task }
    }

    pub(crate) async fn stop(self) {
        self.stop_tx.send_replace(true);
        if let Err(e) = self.task.await {
            debug!("Heartbeat task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::directory::FileDirectory;
    use crate::health::HealthClient;
    use crate::stack::tests::{fast_opts, profile, BindingLauncher};
    use crate::tunnel::tests::ScriptLauncher;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;
    use tunnelkit_proxy::{Dialer, DirectDialer, LocalProxy, ProxyOptions};

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn target_opts() -> TargetOptions {
        TargetOptions {
            health_interval: Duration::from_millis(200),
            terminate_grace: Duration::from_millis(300),
            ..TargetOptions::default()
        }
    }

    fn directory_with_profile(dir: &std::path::Path) -> Arc<FileDirectory> {
        let directory = Arc::new(FileDirectory::new(dir.join("config.json")));
        directory
            .update(&mut |cfg| {
                cfg.upsert_profile(profile());
                Ok(())
            })
            .unwrap();
        directory
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_run_reuses_registered_instance() {
        let dir = tempdir().unwrap();
        let directory = directory_with_profile(dir.path());

        // a healthy instance owned by this process, as a previous run leaves it
        let dialer: Arc<dyn Dialer> = Arc::new(DirectDialer::new(Duration::from_secs(1)));
        let proxy = LocalProxy::new(dialer, ProxyOptions::for_instance("prev-inst"));
        let addr = proxy.start("127.0.0.1:0").await.unwrap();
        let now = Utc::now();
        directory
            .record_instance(Instance {
                id: "prev-inst".to_string(),
                profile_id: "p1".to_string(),
                http_port: addr.port(),
                socks_port: 1080,
                daemon_pid: Pid::this().as_raw(),
                started_at: now,
                last_seen_at: now,
            })
            .unwrap();

        let launcher = Arc::new(ScriptLauncher::new("exit 255"));
        let runner = Runner::new(directory.clone(), Arc::new(HealthClient::default()))
            .with_stack_options(fast_opts(launcher.clone()));

        // stale snapshot: the instance only shows up on the fresh load
        let (_tx, mut cancel) = cancel::channel();
        let expected = format!("http://127.0.0.1:{}", addr.port());
        let script = format!("test \"$HTTP_PROXY\" = \"{}\"", expected);
        runner
            .run(&Config::default(), &profile(), sh(&script), &mut target_opts(), &mut cancel)
            .await
            .unwrap();

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
        assert!(directory.load().unwrap().find_instance("prev-inst").is_some());
        proxy.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_new_stack_registered_then_removed() {
        let dir = tempdir().unwrap();
        let directory = directory_with_profile(dir.path());
        let launcher = Arc::new(BindingLauncher::new(usize::MAX));
        let runner = Runner::new(directory.clone(), Arc::new(HealthClient::default()))
            .with_stack_options(fast_opts(launcher.clone()));

        let config_path = directory.path().display().to_string();
        let script = format!("grep -q '\"profileId\": \"p1\"' '{}'", config_path);
        let cached = directory.load().unwrap();
        let (_tx, mut cancel) = cancel::channel();
        runner
            .run(&cached, &profile(), sh(&script), &mut target_opts(), &mut cancel)
            .await
            .unwrap();

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert!(directory.load().unwrap().instances.is_empty());
    }

    #[tokio::test]
    async fn test_new_stack_failure_leaves_no_instance() {
        let dir = tempdir().unwrap();
        let directory = directory_with_profile(dir.path());
        let launcher = Arc::new(ScriptLauncher::new("exit 255"));
        let runner = Runner::new(directory.clone(), Arc::new(HealthClient::default()))
            .with_stack_options(fast_opts(launcher.clone()));

        let (_tx, mut cancel) = cancel::channel();
        let err = runner
            .run(&Config::default(), &profile(), sh("exit 0"), &mut target_opts(), &mut cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelkitError::Tunnel(_)), "{}", err);
        assert!(directory.load().unwrap().instances.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_stack_starts() {
        let dir = tempdir().unwrap();
        let directory = directory_with_profile(dir.path());
        // ssh stand-in that never serves SOCKS
        let launcher = Arc::new(ScriptLauncher::new("exec sleep 60"));
        let runner = Runner::new(directory.clone(), Arc::new(HealthClient::default()))
            .with_stack_options(fast_opts(launcher.clone()));

        let (cancel_tx, mut cancel) = cancel::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_tx.send_replace(true);
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let marker = dir.path().join("target-ran");
        let script = format!("touch '{}'", marker.display());
        let started = std::time::Instant::now();
        let err = runner
            .run(&Config::default(), &profile(), sh(&script), &mut target_opts(), &mut cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelkitError::Cancelled), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert!(!marker.exists());
        assert!(directory.load().unwrap().instances.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_target_exit_code_survives_cleanup() {
        let dir = tempdir().unwrap();
        let directory = directory_with_profile(dir.path());
        let launcher = Arc::new(BindingLauncher::new(usize::MAX));
        let runner = Runner::new(directory.clone(), Arc::new(HealthClient::default()))
            .with_stack_options(fast_opts(launcher));

        let (_tx, mut cancel) = cancel::channel();
        let err = runner
            .run(&Config::default(), &profile(), sh("exit 7"), &mut target_opts(), &mut cancel)
            .await
            .unwrap_err();
        assert_eq!(err.target_exit_code(), Some(7));
        assert!(directory.load().unwrap().instances.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_advances_last_seen() {
        let dir = tempdir().unwrap();
        let directory = Arc::new(FileDirectory::new(dir.path().join("config.json")));
        let started = Utc::now() - chrono::Duration::minutes(5);
        directory
            .record_instance(Instance {
                id: "hb".to_string(),
                profile_id: "p1".to_string(),
                http_port: 8080,
                socks_port: 1080,
                daemon_pid: 1,
                started_at: started,
                last_seen_at: started,
            })
            .unwrap();

        let heartbeat = Heartbeat::spawn(directory.clone(), "hb".to_string(), Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(200)).await;
        heartbeat.stop().await;

        let inst = directory.load().unwrap().find_instance("hb").cloned().unwrap();
        assert!(inst.last_seen_at > started);
        assert_eq!(inst.started_at, started);
    }
}
