//! Health probe for a running local proxy.
//!
//! The probe is a plain `GET http://127.0.0.1:<port>/_codex_proxy/health`
//! sent directly (never through an environment proxy). A healthy proxy
//! answers `200` with `{"ok":true,"instanceId":"<id>"}`.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tunnelkit_proxy::HEALTH_PATH;

/// Default timeout for one probe.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a health probe failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthError {
    #[error("invalid http port {0}")]
    InvalidPort(u16),

    #[error("health request failed: {0}")]
    Request(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("invalid health response: {0}")]
    Decode(String),

    #[error("health check not ok")]
    NotOk,

    #[error("unexpected instance id {actual:?} (expected {expected:?})")]
    InstanceMismatch { expected: String, actual: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    ok: bool,
    #[serde(default)]
    instance_id: String,
}

/// Something that can tell whether the proxy on `port` is healthy.
///
/// Implemented by [`HealthClient`]; tests substitute fakes.
pub trait HealthProbe: Send + Sync {
    fn check(&self, port: u16, instance_id: &str) -> Result<(), HealthError>;
}

/// Blocking HTTP health client.
#[derive(Debug, Clone, Copy)]
pub struct HealthClient {
    pub timeout: Duration,
}

impl Default for HealthClient {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl HealthClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Probe the proxy on `port`.
    ///
    /// An empty `expected_instance_id` skips the instance check.
    pub fn check_http_proxy(&self, port: u16, expected_instance_id: &str) -> Result<(), HealthError> {
        if port == 0 {
            return Err(HealthError::InvalidPort(port));
        }

        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(self.timeout))
            .proxy(None)
            .http_status_as_error(false)
            .build()
            .new_agent();

        let url = format!("http://127.0.0.1:{}{}", port, HEALTH_PATH);
        let response = agent
            .get(&url)
            .call()
            .map_err(|e| HealthError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(HealthError::Status(status));
        }

        let body = response
            .into_body()
            .read_to_string()
            .map_err(|e| HealthError::Request(e.to_string()))?;
        let parsed: HealthResponse =
            serde_json::from_str(&body).map_err(|e| HealthError::Decode(e.to_string()))?;

        if !parsed.ok {
            return Err(HealthError::NotOk);
        }
        if !expected_instance_id.is_empty() && parsed.instance_id != expected_instance_id {
            return Err(HealthError::InstanceMismatch {
                expected: expected_instance_id.to_string(),
                actual: parsed.instance_id,
            });
        }
        Ok(())
    }
}

impl HealthProbe for HealthClient {
    fn check(&self, port: u16, instance_id: &str) -> Result<(), HealthError> {
        self.check_http_proxy(port, instance_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    /// Serve one canned HTTP response per connection on a background thread.
    fn canned_server(status_line: &'static str, body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(mut conn) = conn else { break };
                let mut reader = BufReader::new(conn.try_clone().unwrap());
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                        break;
                    }
                }
                let response = format!(
                    "{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = conn.write_all(response.as_bytes());
            }
        });
        port
    }

    fn client() -> HealthClient {
        HealthClient::new(Duration::from_millis(500))
    }

    #[test]
    fn test_healthy_with_matching_id() {
        let port = canned_server("HTTP/1.1 200 OK", r#"{"ok":true,"instanceId":"inst-1"}"#);
        client().check_http_proxy(port, "inst-1").unwrap();
        client().check_http_proxy(port, "").unwrap();
    }

    #[test]
    fn test_instance_mismatch() {
        let port = canned_server("HTTP/1.1 200 OK", r#"{"ok":true,"instanceId":"inst-1"}"#);
        let err = client().check_http_proxy(port, "wrong").unwrap_err();
        assert_eq!(
            err,
            HealthError::InstanceMismatch {
                expected: "wrong".to_string(),
                actual: "inst-1".to_string(),
            }
        );
    }

    #[test]
    fn test_invalid_port() {
        assert_eq!(
            client().check_http_proxy(0, "").unwrap_err(),
            HealthError::InvalidPort(0)
        );
    }

    #[test]
    fn test_non_200_status() {
        let port = canned_server(
            "HTTP/1.1 500 Internal Server Error",
            r#"{"ok":true,"instanceId":"x"}"#,
        );
        assert_eq!(
            client().check_http_proxy(port, "").unwrap_err(),
            HealthError::Status(500)
        );
    }

    #[test]
    fn test_invalid_json() {
        let port = canned_server("HTTP/1.1 200 OK", "not-json");
        assert!(matches!(
            client().check_http_proxy(port, "").unwrap_err(),
            HealthError::Decode(_)
        ));
    }

    #[test]
    fn test_ok_false() {
        let port = canned_server("HTTP/1.1 200 OK", r#"{"ok":false,"instanceId":"x"}"#);
        assert_eq!(
            client().check_http_proxy(port, "").unwrap_err(),
            HealthError::NotOk
        );
    }

    #[test]
    fn test_nothing_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(matches!(
            client().check_http_proxy(port, "").unwrap_err(),
            HealthError::Request(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_against_local_proxy() {
        use std::sync::Arc;
        use tunnelkit_proxy::{Dialer, DirectDialer, LocalProxy, ProxyOptions};

        let dialer: Arc<dyn Dialer> = Arc::new(DirectDialer::new(Duration::from_secs(1)));
        let proxy = LocalProxy::new(dialer, ProxyOptions::for_instance("live-inst"));
        let addr = proxy.start("127.0.0.1:0").await.unwrap();

        let port = addr.port();
        let result = tokio::task::spawn_blocking(move || client().check_http_proxy(port, "live-inst"))
            .await
            .unwrap();
        assert!(result.is_ok(), "{:?}", result);

        proxy.close().await.unwrap();
    }
}
