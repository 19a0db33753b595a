//! Proxy configuration types.

/// Static options for a [`LocalProxy`](crate::LocalProxy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyOptions {
    /// Instance ID reported by the health endpoint.
    pub instance_id: String,

    /// Maximum concurrent connections (0 = unlimited).
    pub max_connections: usize,

    /// Seconds a client gets to send the full request head.
    pub header_timeout_secs: u64,
}

impl ProxyOptions {
    /// Options for the given instance ID with default limits.
    #[must_use]
    pub fn for_instance(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            max_connections: 256,
            header_timeout_secs: 10,
        }
    }
}
