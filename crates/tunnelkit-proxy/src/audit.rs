//! Audit logging for proxy requests.
//!
//! Logs every proxied request with structured fields via `tracing`.
//! Request bodies and header values are never included.

use tracing::info;

/// Proxy mode for audit logging.
#[derive(Debug, Clone, Copy)]
pub enum ProxyMode {
    /// CONNECT tunnel
    Connect,
    /// Plain HTTP forwarding
    Forward,
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyMode::Connect => write!(f, "connect"),
            ProxyMode::Forward => write!(f, "forward"),
        }
    }
}

/// Log a request that was dialed successfully.
pub fn log_allowed(mode: ProxyMode, host: &str, port: u16, method: &str) {
    info!(
        target: "tunnelkit_proxy::audit",
        mode = %mode,
        host = host,
        port = port,
        method = method,
        decision = "allow",
        "proxy request allowed"
    );
}

/// Log a request rejected by the target filter.
pub fn log_denied(mode: ProxyMode, host: &str, port: u16, reason: &str) {
    info!(
        target: "tunnelkit_proxy::audit",
        mode = %mode,
        host = host,
        port = port,
        decision = "deny",
        reason = reason,
        "proxy request denied"
    );
}

/// Log a request whose upstream dial failed.
pub fn log_dial_failed(mode: ProxyMode, host: &str, port: u16, reason: &str) {
    info!(
        target: "tunnelkit_proxy::audit",
        mode = %mode,
        host = host,
        port = port,
        decision = "error",
        reason = reason,
        "proxy upstream dial failed"
    );
}
