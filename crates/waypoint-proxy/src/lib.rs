//! Forward HTTP proxy engine.
//!
//! `waypoint-proxy` accepts proxy-style HTTP/1.x requests from clients and
//! relays them to their destinations. Two request shapes are supported:
//!
//! - `CONNECT host:port` opens an opaque byte tunnel (typically carrying TLS).
//! - Any other method with an absolute `http://` target is re-issued to the
//!   origin and the raw response is streamed back.
//!
//! # Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ProxyServer (accept loop, one task per connection)
//!   |
//!   +-- read request head
//!   |
//!   +-- CONNECT?  --> tunnel: connect upstream, "200 Connection Established",
//!   |                 relay bytes both ways until close / reset / idle
//!   |
//!   +-- otherwise --> forward: validate absolute URI, connect upstream,
//!                     write request head (+ body), stream response back
//! ```
//!
//! # Components
//!
//! - [`ProxyServer`]: Accepts connections and dispatches requests
//! - [`handle_connect`]: Establishes and accounts for a CONNECT tunnel
//! - [`handle_forward`]: Plain-HTTP forwarding path
//! - [`relay`]: Bidirectional byte relay with an idle timeout
//! - [`TunnelIds`]: Server-wide tunnel identifier allocation
//!
//! # Usage
//!
//! ```ignore
//! use waypoint_proxy::{ProxyConfig, ProxyServer};
//!
//! let config = ProxyConfig {
//!     bind_addr: "127.0.0.1:8888".parse()?,
//!     ..Default::default()
//! };
//!
//! let handle = ProxyServer::new(config)?.start().await?;
//! // ...
//! handle.shutdown().await?;
//! ```

mod forward;
mod human;
mod relay;
mod request;
mod response;
mod server;
mod tunnel;

pub use forward::{build_upstream_request, handle_forward, ForwardTarget, Scheme};
pub use human::{HumanBytes, HumanRate};
pub use relay::{relay, RelayEnd, RelayOutcome, Side, RELAY_BUFFER_SIZE};
pub use request::{Header, RequestHead, HEADER_SECTION_MAX_LENGTH};
pub use server::{ProxyConfig, ProxyHandle, ProxyServer};
pub use tunnel::{handle_connect, Authority, TunnelSummary};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur in proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to bind to address.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Outbound TCP connection failed (resolution, refusal or timeout).
    #[error("TCP connection to {target} failed: {source}")]
    TcpConnection {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// The request target cannot be proxied.
    #[error("Invalid request target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },

    /// The request head could not be parsed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Socket I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Allocator for tunnel identifiers.
///
/// Identifiers start at 1 and increase by one for every established tunnel.
/// They are never reused for the lifetime of the allocator, which is owned by
/// a single [`ProxyServer`].
#[derive(Debug, Default)]
pub struct TunnelIds {
    last: AtomicU64,
}

impl TunnelIds {
    /// Create an allocator whose first identifier is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next tunnel identifier.
    pub fn allocate(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of identifiers handed out so far.
    pub fn issued(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}
