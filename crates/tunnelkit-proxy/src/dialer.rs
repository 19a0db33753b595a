//! Outbound connection abstraction.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Boxed future returned by [`Dialer::dial`].
pub type DialFuture<'a> = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send + 'a>>;

/// Opens outbound TCP connections on behalf of the proxy.
///
/// Implementations must bound their own latency; the proxy applies no
/// extra timeout around `dial`.
pub trait Dialer: Send + Sync {
    /// Connect to `addr`, given as `host:port` (IPv6 hosts in brackets).
    fn dial<'a>(&'a self, addr: &'a str) -> DialFuture<'a>;
}

/// Dials the target directly over TCP.
#[derive(Debug, Clone)]
pub struct DirectDialer {
    timeout: Duration,
}

impl DirectDialer {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Dialer for DirectDialer {
    fn dial<'a>(&'a self, addr: &'a str) -> DialFuture<'a> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
                Ok(result) => result,
                Err(_) => {
                    debug!("Direct dial to {} timed out", addr);
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("dial {} timed out after {:?}", addr, self.timeout),
                    ))
                }
            }
        })
    }
}

/// Split `host:port` into its parts, stripping IPv6 brackets.
pub(crate) fn split_host_port(addr: &str) -> io::Result<(String, u16)> {
    let invalid = || {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid address {:?}: expected host:port", addr),
        )
    };
    let (host, port_str) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let port = port_str.parse::<u16>().map_err(|_| invalid())?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            split_host_port("[::1]:8080").unwrap(),
            ("::1".to_string(), 8080)
        );
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port(":443").is_err());
        assert!(split_host_port("host:99999").is_err());
    }

    #[tokio::test]
    async fn test_direct_dialer_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let dialer = DirectDialer::new(Duration::from_secs(1));
        let stream = dialer.dial(&addr).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().to_string(), addr);
    }

    #[tokio::test]
    async fn test_direct_dialer_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let dialer = DirectDialer::new(Duration::from_secs(1));
        assert!(dialer.dial(&addr).await.is_err());
    }
}
