//! `tunnelkit run`: run a target command through the proxy.

use crate::cli::RunArgs;
use crate::output;
use crate::profile_cmd::resolve_profile;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tunnelkit::signature::probe_yolo_args;
use tunnelkit::supervisor::run_target_with_fallback;
use tunnelkit::{
    CrashRecorder, FileDirectory, HealthClient, InstanceDirectory, PatchFailureRecorder,
    PatchHistoryStore, Result, Runner, TargetOptions,
};

/// Command run when none is given.
const DEFAULT_COMMAND: &str = "codex";

pub fn run_target(args: RunArgs, config: Option<PathBuf>, silent: bool) -> Result<()> {
    let directory = Arc::new(crate::open_directory(config)?);
    let snapshot = directory.load()?;

    let mut cmd = if args.command.is_empty() {
        vec![DEFAULT_COMMAND.to_string()]
    } else {
        args.command
    };
    let use_proxy = !args.no_proxy && snapshot.proxy_enabled != Some(false);
    let want_yolo = args.yolo || snapshot.yolo_enabled == Some(true);
    // resolved before any runtime work so a bad profile fails fast
    let profile = if use_proxy {
        Some(resolve_profile(&snapshot, args.profile.as_deref())?)
    } else {
        None
    };

    let mut opts = TargetOptions {
        cwd: args.cwd,
        use_proxy,
        crash_recorder: crash_recorder(&directory, &cmd[0]),
        on_fallback: Some(disable_yolo_hook(directory.clone())),
        ..TargetOptions::default()
    };

    crate::block_on_cancellable(|mut cancel| async move {
        if want_yolo {
            let yolo_args = probe_yolo_args(&cmd[0]).await;
            if yolo_args.is_empty() {
                output::print_warning(
                    silent,
                    &format!("{} lists no known yolo flag, running without one", cmd[0]),
                );
            } else {
                debug!("Yolo arguments for {}: {:?}", cmd[0], yolo_args);
                cmd.splice(1..1, yolo_args);
                opts.yolo_enabled = true;
            }
        }

        let Some(profile) = profile else {
            output::print_status(silent, "running without proxy");
            return run_target_with_fallback(cmd, None, None, &mut cancel, &mut opts).await;
        };
        output::print_status(
            silent,
            &format!("proxying via {}@{} ({})", profile.user, profile.host, profile.name),
        );
        let runner = Runner::new(directory.clone(), Arc::new(HealthClient::default()));
        runner
            .run(&snapshot, &profile, cmd, &mut opts, &mut cancel)
            .await
    })
}

/// Persists `yoloEnabled: false` once the target has rejected its flags.
fn disable_yolo_hook(directory: Arc<FileDirectory>) -> tunnelkit::supervisor::FallbackHook {
    Box::new(move || {
        directory.update(&mut |cfg| {
            cfg.yolo_enabled = Some(false);
            Ok(())
        })?;
        info!("Disabled yolo mode in {}", directory.path().display());
        Ok(())
    })
}

/// Recorder marking the target binary as failed in patch history, when
/// that binary has a history entry.
fn crash_recorder(directory: &FileDirectory, program: &str) -> Option<Arc<dyn CrashRecorder>> {
    let path = which::which(program).ok()?.display().to_string();
    let store = match PatchHistoryStore::new(directory.dir()) {
        Ok(store) => store,
        Err(e) => {
            debug!("Patch history unavailable: {}", e);
            return None;
        }
    };
    let entry = match store.latest_for_path(&path) {
        Ok(entry) => entry?,
        Err(e) => {
            warn!("Failed to read patch history: {}", e);
            return None;
        }
    };
    if entry.failed {
        warn!(
            "{} previously failed after patching: {}",
            path, entry.failure_reason
        );
    }
    Some(Arc::new(PatchFailureRecorder::new(
        store,
        path,
        entry.orig_sha256,
        env!("CARGO_PKG_VERSION"),
    )))
}
