//! Secondary validation hook for proxy targets.
//!
//! The proxy is loopback-only and trusts its clients, so no filter is
//! installed by default. Callers that need to restrict what the tunnel may
//! reach pass a [`TargetFilter`] to
//! [`LocalProxy::with_filter`](crate::LocalProxy::with_filter); it is
//! consulted for both CONNECT and plain HTTP before the dialer runs.

/// Decides whether `host:port` may be dialed.
pub trait TargetFilter: Send + Sync {
    /// Returns `Err(reason)` when the target must be refused.
    fn check(&self, host: &str, port: u16) -> Result<(), String>;
}

impl<F> TargetFilter for F
where
    F: Fn(&str, u16) -> Result<(), String> + Send + Sync,
{
    fn check(&self, host: &str, port: u16) -> Result<(), String> {
        self(host, port)
    }
}
