//! Plain HTTP forwarding.
//!
//! Requests arrive in absolute form (`GET http://host:port/path HTTP/1.1`).
//! The handler dials `host:port` through the proxy's dialer, rewrites the
//! request line to origin form, drops proxy hop-by-hop headers and forces
//! `Connection: close`, then relays the request body and the response.
//! Each client connection carries exactly one exchange: the response head
//! is rewritten to `Connection: close` and the connection ends with the
//! response, so a client never sends a second request to the first
//! request's upstream. The upstream status, other headers and body reach
//! the client unchanged, so non-2xx responses are passed through rather
//! than treated as local errors.

use crate::audit;
use crate::connect::join_host_port;
use crate::error::{ProxyError, Result};
use crate::server::{send_error, ProxyState, RequestHead};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

/// Headers that only apply to the client-to-proxy hop.
const HOP_HEADERS: &[&str] = &[
    "proxy-connection",
    "proxy-authorization",
    "connection",
    "keep-alive",
];

/// Upper bound on a buffered upstream response head.
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

#[derive(Debug, PartialEq, Eq)]
struct ForwardTarget {
    host: String,
    port: u16,
    /// Path plus query, always starting with `/`.
    path: String,
}

/// Handle a non-CONNECT request.
///
/// `buffered_body` contains any bytes read past the request head; they are
/// written upstream right after the rewritten head.
pub(crate) async fn handle_forward(
    head: &RequestHead,
    stream: &mut TcpStream,
    buffered_body: &[u8],
    state: &ProxyState,
) -> Result<()> {
    let target = match resolve_target(head) {
        Ok(target) => target,
        Err(e) => {
            send_error(stream, 400, "Bad Request", &e.to_string()).await?;
            return Err(e);
        }
    };
    debug!("Forward {} {}:{}{}", head.method, target.host, target.port, target.path);

    if let Some(filter) = &state.filter {
        if let Err(reason) = filter.check(&target.host, target.port) {
            audit::log_denied(audit::ProxyMode::Forward, &target.host, target.port, &reason);
            send_error(stream, 403, "Forbidden", &reason).await?;
            return Err(ProxyError::TargetDenied {
                host: target.host,
                reason,
            });
        }
    }

    let authority = join_host_port(&target.host, target.port);
    let mut upstream = match state.dialer.dial(&authority).await {
        Ok(upstream) => upstream,
        Err(e) => {
            let reason = e.to_string();
            audit::log_dial_failed(audit::ProxyMode::Forward, &target.host, target.port, &reason);
            send_error(stream, 502, "Bad Gateway", &format!("round trip: {}", reason)).await?;
            return Err(ProxyError::UpstreamConnect {
                host: target.host,
                reason,
            });
        }
    };

    let request = build_upstream_head(head, &target);
    upstream.write_all(request.as_bytes()).await?;
    if !buffered_body.is_empty() {
        upstream.write_all(buffered_body).await?;
    }
    audit::log_allowed(audit::ProxyMode::Forward, &target.host, target.port, &head.method);

    let (mut client_rd, mut client_wr) = stream.split();
    let (mut upstream_rd, mut upstream_wr) = upstream.split();
    let response = relay_response(&mut upstream_rd, &mut client_wr);
    tokio::pin!(response);
    let mut request_open = true;
    let result = loop {
        tokio::select! {
            res = &mut response => break res,
            res = tokio::io::copy(&mut client_rd, &mut upstream_wr), if request_open => {
                request_open = false;
                if let Err(e) = res {
                    debug!("Forward request body to {}:{}: {}", target.host, target.port, e);
                }
            }
        }
    };
    debug!(
        "Forward to {}:{} finished: {:?}",
        target.host, target.port, result
    );
    Ok(())
}

/// Relay one upstream response, rewriting its head to `Connection: close`.
///
/// Returns once the upstream closes.
async fn relay_response<R, W>(upstream: &mut R, client: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(end) = find_head_end(&buf) {
            break Some(end);
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            break None;
        }
        let n = upstream.read(&mut chunk).await?;
        if n == 0 {
            break None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    match head_end {
        Some(end) => {
            client.write_all(close_response_head(&buf[..end]).as_bytes()).await?;
            client.write_all(&buf[end..]).await?;
        }
        None => client.write_all(&buf).await?,
    }
    let relayed = buf.len() as u64 + tokio::io::copy(upstream, client).await?;
    client.flush().await?;
    Ok(relayed)
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Response head with hop headers replaced by `Connection: close`.
fn close_response_head(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split("\r\n").filter(|l| !l.is_empty());
    let mut out = String::new();
    if let Some(status) = lines.next() {
        out.push_str(status);
        out.push_str("\r\n");
    }
    for line in lines {
        let name = line.split(':').next().unwrap_or_default().trim();
        if HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str("Connection: close\r\n\r\n");
    out
}

/// Work out where a request should go.
///
/// Absolute-form targets must use the `http` scheme. Origin-form targets
/// fall back to the `Host` header.
fn resolve_target(head: &RequestHead) -> Result<ForwardTarget> {
    if head.target.starts_with('/') {
        let host_header = head
            .header("host")
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::HttpParse("missing host".to_string()))?;
        let url = Url::parse(&format!("http://{}", host_header))
            .map_err(|e| ProxyError::HttpParse(format!("invalid Host header: {}", e)))?;
        let host = url_host(&url)?;
        return Ok(ForwardTarget {
            host,
            port: url.port().unwrap_or(80),
            path: head.target.clone(),
        });
    }

    let url = Url::parse(&head.target)
        .map_err(|e| ProxyError::HttpParse(format!("invalid request target: {}", e)))?;
    if url.scheme() != "http" {
        return Err(ProxyError::HttpParse(format!(
            "unsupported scheme {:?} (use CONNECT for TLS)",
            url.scheme()
        )));
    }
    let host = url_host(&url)?;
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    Ok(ForwardTarget {
        host,
        port: url.port_or_known_default().unwrap_or(80),
        path,
    })
}

fn url_host(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProxyError::HttpParse("missing host".to_string()))?;
    Ok(host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_string())
}

/// Rebuild the request head in origin form for the upstream server.
fn build_upstream_head(head: &RequestHead, target: &ForwardTarget) -> String {
    let mut out = format!("{} {} {}\r\n", head.method, target.path, head.version);
    let mut saw_host = false;
    for (name, value) in &head.headers {
        let lower = name.to_ascii_lowercase();
        if HOP_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if lower == "host" {
            saw_host = true;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    if !saw_host {
        let host = match (target.port, target.host.contains(':')) {
            (80, false) => target.host.clone(),
            (80, true) => format!("[{}]", target.host),
            _ => join_host_port(&target.host, target.port),
        };
        out.push_str(&format!("Host: {}\r\n", host));
    }
    out.push_str("Connection: close\r\n\r\n");
    out
}
