//! HTTP CONNECT tunnel handler.
//!
//! Handles `CONNECT host:port HTTP/1.1` requests by:
//! 1. Validating the `host:port` authority (400 when malformed)
//! 2. Consulting the optional target filter (403)
//! 3. Dialing the target through the proxy's dialer (502 on failure)
//! 4. Returning `200 Connection Established`
//! 5. Relaying bytes bidirectionally until either side closes
//!
//! The proxy never terminates TLS; it just passes encrypted bytes through.

use crate::audit;
use crate::error::{ProxyError, Result};
use crate::server::{send_error, send_response, ProxyState, RequestHead};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Handle a CONNECT request.
///
/// `pipelined` holds bytes the client sent after the request head before
/// waiting for our reply; they are written upstream first.
pub(crate) async fn handle_connect(
    head: &RequestHead,
    stream: &mut TcpStream,
    pipelined: &[u8],
    state: &ProxyState,
) -> Result<()> {
    let (host, port) = match parse_connect_target(&head.target) {
        Ok(target) => target,
        Err(e) => {
            send_error(stream, 400, "Bad Request", &e.to_string()).await?;
            return Err(e);
        }
    };
    debug!("CONNECT request to {}:{}", host, port);

    if let Some(filter) = &state.filter {
        if let Err(reason) = filter.check(&host, port) {
            audit::log_denied(audit::ProxyMode::Connect, &host, port, &reason);
            send_error(stream, 403, "Forbidden", &reason).await?;
            return Err(ProxyError::TargetDenied { host, reason });
        }
    }

    let authority = join_host_port(&host, port);
    let mut upstream = match state.dialer.dial(&authority).await {
        Ok(upstream) => upstream,
        Err(e) => {
            let reason = e.to_string();
            audit::log_dial_failed(audit::ProxyMode::Connect, &host, port, &reason);
            send_error(
                stream,
                502,
                "Bad Gateway",
                &format!("dial upstream: {}", reason),
            )
            .await?;
            return Err(ProxyError::UpstreamConnect { host, reason });
        }
    };

    send_response(stream, 200, "Connection Established").await?;
    audit::log_allowed(audit::ProxyMode::Connect, &host, port, "CONNECT");

    if !pipelined.is_empty() {
        upstream.write_all(pipelined).await?;
    }

    let result = tokio::io::copy_bidirectional(stream, &mut upstream).await;
    debug!("CONNECT tunnel closed for {}:{}: {:?}", host, port, result);

    Ok(())
}

/// Parse the target host and port from a CONNECT authority.
///
/// Expected format: `host:port` or `[v6]:port`. The port is required.
fn parse_connect_target(authority: &str) -> Result<(String, u16)> {
    let invalid = || ProxyError::HttpParse(format!("invalid CONNECT target: {:?}", authority));
    let (host, port_str) = authority.rsplit_once(':').ok_or_else(invalid)?;
    // an unbracketed IPv6 literal has no unambiguous port
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(invalid());
    }
    let port = match port_str.parse::<u16>() {
        Ok(port) if port != 0 => port,
        _ => return Err(invalid()),
    };
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(ProxyError::HttpParse(format!(
            "missing host in CONNECT: {:?}",
            authority
        )));
    }
    Ok((host.to_string(), port))
}

/// Join host and port, bracketing IPv6 literals.
pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
