//! Error types for the tunnelkit library.
//!
//! Each variant names the layer that failed (tunnel, proxy, directory,
//! health, target) so the CLI can print a single wrapped error.

use crate::health::HealthError;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Errors produced by tunnelkit operations.
#[derive(Error, Debug)]
pub enum TunnelkitError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("SSH tunnel failed to start ({program}): {source}")]
    TunnelSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SSH tunnel error: {0}")]
    Tunnel(String),

    #[error("Local proxy error: {0}")]
    Proxy(#[from] tunnelkit_proxy::ProxyError),

    #[error("Instance directory {}: {reason}", path.display())]
    Directory { path: PathBuf, reason: String },

    #[error("Health check failed: {0}")]
    Health(#[from] HealthError),

    #[error("Proxy stack failed: {0}")]
    StackFatal(String),

    #[error("proxy unhealthy; terminated target: {0}")]
    ProxyUnhealthy(#[source] HealthError),

    #[error("proxy stack failed; terminated target: {0}")]
    TargetStackFailed(String),

    #[error("Failed to start target command {program}: {source}")]
    TargetSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Target command exited with {0}")]
    TargetExit(ExitStatus),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelkitError {
    /// Shorthand for a [`TunnelkitError::Directory`] error.
    pub fn directory(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        TunnelkitError::Directory {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Exit code of the target command, when this error is a plain
    /// non-zero exit.
    #[must_use]
    pub fn target_exit_code(&self) -> Option<i32> {
        match self {
            TunnelkitError::TargetExit(status) => status.code(),
            _ => None,
        }
    }
}

/// Result type alias for tunnelkit operations.
pub type Result<T> = std::result::Result<T, TunnelkitError>;
