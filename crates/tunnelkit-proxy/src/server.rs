//! Proxy server: TCP listener, request-head parsing, dispatch, and lifecycle.
//!
//! The server binds an explicit loopback address (port 0 = OS-assigned),
//! accepts TCP connections, reads the request head, and dispatches:
//!
//! `GET /_codex_proxy/health` -> answered locally
//! `CONNECT host:port`        -> [`connect`] handler
//! anything else              -> [`forward`] handler

use crate::config::ProxyOptions;
use crate::connect;
use crate::dialer::Dialer;
use crate::error::{ProxyError, Result};
use crate::filter::TargetFilter;
use crate::forward;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Path of the local health endpoint.
pub const HEALTH_PATH: &str = "/_codex_proxy/health";

/// Maximum total size of the request head (64 KiB). Prevents OOM from
/// clients sending unbounded header data.
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Request line and headers of one client request.
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

enum HeadRead {
    Complete(RequestHead),
    Closed,
    TooLarge,
    Malformed(String),
}

/// State shared by the accept loop and every connection task.
pub(crate) struct ProxyState {
    pub dialer: Arc<dyn Dialer>,
    pub filter: Option<Arc<dyn TargetFilter>>,
    pub options: ProxyOptions,
    active_connections: AtomicUsize,
}

/// Decrements the active connection count when a connection task ends,
/// including when it is aborted during shutdown.
struct ConnectionSlot(Arc<ProxyState>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

struct Running {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Loopback HTTP forward proxy.
///
/// Construct with a [`Dialer`], then [`start`](Self::start) on an address.
/// [`close`](Self::close) stops the listener, aborts in-flight connections
/// and returns once the port is released.
pub struct LocalProxy {
    dialer: Arc<dyn Dialer>,
    filter: Option<Arc<dyn TargetFilter>>,
    options: ProxyOptions,
    running: Mutex<Option<Running>>,
}

impl LocalProxy {
    #[must_use]
    pub fn new(dialer: Arc<dyn Dialer>, options: ProxyOptions) -> Self {
        Self {
            dialer,
            filter: None,
            options,
            running: Mutex::new(None),
        }
    }

    /// Install a secondary validation hook consulted before every dial.
    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn TargetFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Instance ID reported by the health endpoint.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.options.instance_id
    }

    /// Bind `listen_addr` and start accepting connections.
    ///
    /// Fails if the proxy is already running or the address cannot be bound.
    /// Returns the actual bound address.
    pub async fn start(&self, listen_addr: &str) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(existing) = running.as_ref() {
            return Err(ProxyError::AlreadyStarted(existing.addr.to_string()));
        }

        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: listen_addr.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
            addr: listen_addr.to_string(),
            source: e,
        })?;

        info!("Local proxy listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(ProxyState {
            dialer: Arc::clone(&self.dialer),
            filter: self.filter.clone(),
            options: self.options.clone(),
            active_connections: AtomicUsize::new(0),
        });
        let task = tokio::spawn(accept_loop(listener, state, shutdown_rx));

        *running = Some(Running {
            addr: local_addr,
            shutdown_tx,
            task,
        });
        Ok(local_addr)
    }

    /// Address the proxy is bound to, if running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.addr)
    }

    /// Stop the proxy. A no-op if it is not running.
    pub async fn close(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        let _ = running.shutdown_tx.send(true);
        running.task.await.map_err(|e| {
            ProxyError::Io(std::io::Error::other(format!(
                "accept loop for {} ended abnormally: {}",
                running.addr, e
            )))
        })
    }
}

/// Accept loop: listen for connections until shutdown, then abort the
/// connection tasks that are still running.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let max = state.options.max_connections;
                        if max > 0 {
                            let current = state.active_connections.load(Ordering::Relaxed);
                            if current >= max {
                                warn!("Connection limit reached ({}/{}), rejecting {}", current, max, addr);
                                drop(stream);
                                continue;
                            }
                        }
                        state.active_connections.fetch_add(1, Ordering::Relaxed);

                        debug!("Accepted connection from {}", addr);
                        let slot = ConnectionSlot(Arc::clone(&state));
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, &slot.0).await {
                                debug!("Connection handler error: {}", e);
                            }
                            drop(slot);
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Local proxy shutting down");
                    break;
                }
            }
        }
    }

    drop(listener);
    connections.abort_all();
    while connections.join_next().await.is_some() {}
}

/// Handle a single client connection.
async fn handle_connection(mut stream: TcpStream, state: &ProxyState) -> Result<()> {
    // The BufReader may read past the request head; whatever it holds is
    // handed to the handler so no client bytes are lost.
    let mut buf_reader = BufReader::new(&mut stream);
    let header_timeout = Duration::from_secs(state.options.header_timeout_secs);
    let head = match tokio::time::timeout(header_timeout, read_request_head(&mut buf_reader)).await
    {
        Ok(head) => head?,
        Err(_) => {
            debug!("Client did not send a request head within {:?}", header_timeout);
            return Ok(());
        }
    };
    let buffered = buf_reader.buffer().to_vec();
    drop(buf_reader);

    let head = match head {
        HeadRead::Complete(head) => head,
        HeadRead::Closed => return Ok(()),
        HeadRead::TooLarge => {
            send_error(
                &mut stream,
                431,
                "Request Header Fields Too Large",
                "request header too large",
            )
            .await?;
            return Ok(());
        }
        HeadRead::Malformed(reason) => {
            send_error(&mut stream, 400, "Bad Request", &reason).await?;
            return Err(ProxyError::HttpParse(reason));
        }
    };

    if head.method == "GET" && is_health_request(&head.target) {
        return send_health(&mut stream, &state.options.instance_id).await;
    }

    if head.method.eq_ignore_ascii_case("CONNECT") {
        connect::handle_connect(&head, &mut stream, &buffered, state).await
    } else {
        forward::handle_forward(&head, &mut stream, &buffered, state).await
    }
}

async fn read_request_head<R>(reader: &mut R) -> Result<HeadRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = reader.take(MAX_HEADER_SIZE as u64);

    let mut first_line = String::new();
    if limited.read_line(&mut first_line).await? == 0 {
        return Ok(HeadRead::Closed);
    }

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let n = limited.read_line(&mut line).await?;
        if n == 0 {
            if limited.limit() == 0 {
                return Ok(HeadRead::TooLarge);
            }
            break;
        }
        if !line.ends_with('\n') && limited.limit() == 0 {
            return Ok(HeadRead::TooLarge);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        match line.split_once(':') {
            Some((name, value)) => {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
            None => {
                return Ok(HeadRead::Malformed(format!("malformed header line: {}", line)));
            }
        }
    }

    let mut parts = first_line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version)) => Ok(HeadRead::Complete(RequestHead {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
        })),
        _ => Ok(HeadRead::Malformed(format!(
            "malformed request line: {}",
            first_line.trim_end()
        ))),
    }
}

/// True when `target` (origin-form or absolute-form) names the health path.
fn is_health_request(target: &str) -> bool {
    if target.starts_with('/') {
        let path = target.split('?').next().unwrap_or(target);
        return path == HEALTH_PATH;
    }
    url::Url::parse(target)
        .map(|u| u.path() == HEALTH_PATH)
        .unwrap_or(false)
}

async fn send_health(stream: &mut TcpStream, instance_id: &str) -> Result<()> {
    let body = serde_json::json!({ "ok": true, "instanceId": instance_id }).to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Send a bare status line (used for `200 Connection Established`).
pub(crate) async fn send_response(stream: &mut TcpStream, status: u16, reason: &str) -> Result<()> {
    let response = format!("HTTP/1.1 {} {}\r\n\r\n", status, reason);
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Send an error response with a short plain-text body.
pub(crate) async fn send_error(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    message: &str,
) -> Result<()> {
    let body = format!("{}\n", message);
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
