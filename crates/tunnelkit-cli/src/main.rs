//! tunnelkit CLI - run command-line tools through a shared SSH tunnel
//!
//! This is the CLI binary on top of the tunnelkit library.

mod cli;
mod output;
mod profile_cmd;
mod proxy_cmd;
mod run_cmd;

use clap::Parser;
use cli::{Cli, Commands};
use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;
use tunnelkit::cancel::{self, CancelReceiver};
use tunnelkit::{FileDirectory, Result, TunnelkitError};

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        // the target already reported its own failure
        if let Some(code) = target_exit_code(&e) {
            debug!("{}", e);
            std::process::exit(code);
        }
        error!("{}", e);
        eprintln!("tunnelkit: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_cmd::run_target(*args, cli.config, cli.silent),
        Commands::Profile(args) => profile_cmd::run_profile(args, cli.config),
        Commands::Proxy(args) => proxy_cmd::run_proxy(args, cli.config, cli.silent),
    }
}

/// Exit code mirroring a failed target: its own code, or 128 + signal.
fn target_exit_code(err: &TunnelkitError) -> Option<i32> {
    match err {
        TunnelkitError::TargetExit(status) => status
            .code()
            .or_else(|| status.signal().map(|sig| 128 + sig)),
        _ => None,
    }
}

/// Directory at `--config` / `TUNNELKIT_CONFIG`, or the default location.
pub(crate) fn open_directory(config: Option<PathBuf>) -> Result<FileDirectory> {
    let path = match config {
        Some(path) => path,
        None => FileDirectory::default_path()?,
    };
    Ok(FileDirectory::new(path))
}

/// Drive `f` to completion on a fresh multi-thread runtime, with SIGINT and
/// SIGTERM wired to the cancellation signal handed to it.
pub(crate) fn block_on_cancellable<F, Fut, T>(f: F) -> Result<T>
where
    F: FnOnce(CancelReceiver) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(TunnelkitError::Io)?;
    rt.block_on(async {
        let (cancel_tx, cancel_rx) = cancel::channel();
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => debug!("SIGINT received"),
                _ = sigterm.recv() => debug!("SIGTERM received"),
            }
            cancel_tx.send_replace(true);
            // keep the sender alive so receivers observe the cancellation
            std::future::pending::<()>().await;
        });
        f(cancel_rx).await
    })
}
