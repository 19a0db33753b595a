//! Loopback forward proxy for tunnelkit.
//!
//! `tunnelkit-proxy` exposes an HTTP proxy on `127.0.0.1` that never opens
//! upstream sockets on its own. Every outbound connection goes through a
//! [`Dialer`]:
//!
//! 1. **Direct** (`dialer::DirectDialer`) - plain TCP connect with a timeout.
//! 2. **SOCKS5** (`socks::Socks5Dialer`) - CONNECT through the dynamic-forward
//!    endpoint of an SSH tunnel.
//!
//! The server understands two request shapes:
//!
//! - `CONNECT host:port` -> [`connect`] splices the client and the dialed
//!   connection byte-for-byte (TLS is never terminated).
//! - Absolute-form `GET http://host/...` -> [`forward`] rewrites the request
//!   line, replays it over the dialed connection and streams the response back.
//!
//! `GET /_codex_proxy/health` is answered locally with the instance ID and
//! is used by every health check in the system.

pub mod audit;
pub mod config;
pub mod connect;
pub mod dialer;
pub mod error;
pub mod filter;
pub mod forward;
pub mod server;
pub mod socks;

pub use config::ProxyOptions;
pub use dialer::{DialFuture, Dialer, DirectDialer};
pub use error::{ProxyError, Result};
pub use filter::TargetFilter;
pub use server::{LocalProxy, HEALTH_PATH};
pub use socks::Socks5Dialer;
