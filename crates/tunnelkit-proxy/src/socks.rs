//! SOCKS5 client dialer (RFC 1928, no-auth CONNECT only).
//!
//! Used to reach the dynamic-forward endpoint that `ssh -D` opens on
//! loopback. Construction only validates the endpoint address; nothing is
//! dialed until the first request, because the dialer is built before the
//! tunnel has finished negotiating.

use crate::dialer::{split_host_port, DialFuture, Dialer};
use crate::error::{ProxyError, Result};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Per-dial timeout used by the stack.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

/// Dials targets through a SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy_addr: SocketAddr,
    timeout: Duration,
}

impl Socks5Dialer {
    /// Create a dialer for the SOCKS5 endpoint at `proxy_addr` (`ip:port`).
    pub fn new(proxy_addr: &str, timeout: Duration) -> Result<Self> {
        let parsed = proxy_addr.parse::<SocketAddr>().map_err(|e| {
            ProxyError::Config(format!("invalid SOCKS5 address {:?}: {}", proxy_addr, e))
        })?;
        Ok(Self {
            proxy_addr: parsed,
            timeout,
        })
    }

    /// The SOCKS5 endpoint this dialer connects to.
    #[must_use]
    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    async fn connect(&self, target: &str) -> io::Result<TcpStream> {
        let (host, port) = split_host_port(target)?;
        let request = encode_connect_request(&host, port)?;

        let mut stream = TcpStream::connect(self.proxy_addr).await?;

        stream
            .write_all(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH])
            .await?;
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != SOCKS_VERSION {
            return Err(protocol_error(format!(
                "unexpected SOCKS version {:#04x} in method reply",
                choice[0]
            )));
        }
        if choice[1] != METHOD_NO_AUTH {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "SOCKS5 server requires authentication",
            ));
        }

        stream.write_all(&request).await?;
        read_connect_reply(&mut stream).await?;

        debug!("SOCKS5 CONNECT {}:{} via {}", host, port, self.proxy_addr);
        Ok(stream)
    }
}

impl Dialer for Socks5Dialer {
    fn dial<'a>(&'a self, addr: &'a str) -> DialFuture<'a> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, self.connect(addr)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "SOCKS5 dial {} via {} timed out after {:?}",
                        addr, self.proxy_addr, self.timeout
                    ),
                )),
            }
        })
    }
}

/// Encode `VER CMD RSV ATYP DST.ADDR DST.PORT`.
fn encode_connect_request(host: &str, port: u16) -> io::Result<Vec<u8>> {
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len()).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("hostname too long for SOCKS5: {} bytes", host.len()),
                )
            })?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

/// Read `VER REP RSV ATYP BND.ADDR BND.PORT` and fail on a non-zero REP.
async fn read_connect_reply(stream: &mut TcpStream) -> io::Result<()> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(protocol_error(format!(
            "unexpected SOCKS version {:#04x} in connect reply",
            head[0]
        )));
    }
    if head[1] != REPLY_SUCCEEDED {
        return Err(reply_error(head[1]));
    }

    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0])
        }
        other => {
            return Err(protocol_error(format!(
                "unknown address type {:#04x} in connect reply",
                other
            )))
        }
    };
    // Bound address and port are not used.
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

fn reply_error(code: u8) -> io::Error {
    let (kind, msg) = match code {
        0x01 => (io::ErrorKind::Other, "general SOCKS server failure"),
        0x02 => (
            io::ErrorKind::PermissionDenied,
            "connection not allowed by ruleset",
        ),
        0x03 => (io::ErrorKind::Other, "network unreachable"),
        0x04 => (io::ErrorKind::Other, "host unreachable"),
        0x05 => (io::ErrorKind::ConnectionRefused, "connection refused"),
        0x06 => (io::ErrorKind::TimedOut, "TTL expired"),
        0x07 => (io::ErrorKind::Unsupported, "command not supported"),
        0x08 => (io::ErrorKind::Unsupported, "address type not supported"),
        _ => (io::ErrorKind::Other, "unknown SOCKS5 error"),
    };
    io::Error::new(kind, format!("socks5: {} ({:#04x})", msg, code))
}

fn protocol_error(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
