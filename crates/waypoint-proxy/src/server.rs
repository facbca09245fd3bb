//! Proxy server: accept loop, per-connection dispatch and lifecycle.
//!
//! # Lifecycle
//!
//! ```text
//! ProxyServer::new(config)
//!       |
//!       v
//! ProxyServer::start() --> ProxyHandle
//!       |                       |
//!       v                       |
//! accept loop                   |
//!   spawn task per connection   |
//!       |                       v
//!       |               ProxyHandle::shutdown()
//!       |                       |
//!       v                       v
//! stop accepting <--------------+
//! ```
//!
//! Connection tasks are detached; shutting down stops the accept loop but
//! lets in-flight tunnels run until they end on their own.

use crate::forward::handle_forward;
use crate::request::RequestHead;
use crate::response::{send_error, ErrorStatus};
use crate::tunnel::handle_connect;
use crate::{ProxyError, Result, TunnelIds};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Configuration for the proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to accept client connections on.
    /// Default: `0.0.0.0:8888`
    pub bind_addr: SocketAddr,

    /// Bound on resolving and connecting to a destination.
    /// Default: 10 seconds
    pub connect_timeout: Duration,

    /// A tunnel or forwarded response ends after this long without traffic.
    /// Default: 10 seconds
    pub idle_timeout: Duration,

    /// A client must deliver its request head within this time.
    /// Default: 10 seconds
    pub request_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8888".parse().expect("hardcoded wildcard address"),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ProxyConfig {
    /// Default configuration listening on `bind_addr`.
    pub fn bound_to(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Use one timeout for connecting, idling and reading request heads.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self.idle_timeout = timeout;
        self.request_timeout = timeout;
        self
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    /// Shutdown signal sender.
    shutdown_tx: Option<oneshot::Sender<()>>,

    /// Join handle for the accept loop task.
    join_handle: Option<tokio::task::JoinHandle<()>>,

    /// Address the listener is actually bound to.
    proxy_addr: SocketAddr,

    tunnels: Arc<TunnelIds>,
}

impl ProxyHandle {
    /// Check if the accept loop is still running.
    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Address clients should connect to.
    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    /// Number of tunnels established since the server started.
    pub fn tunnels_opened(&self) -> u64 {
        self.tunnels.issued()
    }

    /// Stop accepting connections.
    ///
    /// Signals the accept loop and waits up to 2 seconds for it to exit. If
    /// the signal cannot be delivered the task is aborted instead.
    ///
    /// # Errors
    /// Currently infallible; always returns `Ok`.
    pub async fn shutdown(mut self) -> Result<()> {
        let signal_sent = match self.shutdown_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        };

        if let Some(handle) = self.join_handle.take() {
            if signal_sent {
                if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                    warn!("accept loop did not stop within 2s");
                }
            } else {
                handle.abort();
            }
        }

        Ok(())
    }
}

/// Forward proxy server.
pub struct ProxyServer {
    config: ProxyConfig,

    /// Tunnel id allocator shared by every connection of this server.
    tunnels: Arc<TunnelIds>,
}

impl ProxyServer {
    /// Create a new proxy server.
    ///
    /// # Errors
    /// Currently infallible; always returns `Ok`. The `Result` return type
    /// is present for forward compatibility.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        Ok(Self {
            config,
            tunnels: Arc::new(TunnelIds::new()),
        })
    }

    /// Bind the listener and run the accept loop in a background task.
    ///
    /// The listener is bound before this returns, so the handle reports the
    /// actual (possibly OS-assigned) address.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - If binding `config.bind_addr` fails.
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = bind(self.config.bind_addr).await?;
        let proxy_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
            addr: self.config.bind_addr,
            source: e,
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let tunnels = Arc::clone(&self.tunnels);

        let join_handle = tokio::spawn(async move {
            tokio::select! {
                _ = self.run_on(listener) => {}
                _ = shutdown_rx => debug!("proxy shutdown requested"),
            }
        });

        Ok(ProxyHandle {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
            proxy_addr,
            tunnels,
        })
    }

    /// Bind the listener and accept connections until the task is dropped.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - If binding `config.bind_addr` fails.
    pub async fn run(self) -> Result<()> {
        let listener = bind(self.config.bind_addr).await?;
        self.run_on(listener).await;
        Ok(())
    }

    /// Accept connections on a pre-bound listener, forever.
    ///
    /// Each connection is handled in its own task. Accept errors are logged
    /// and do not stop the loop.
    pub async fn run_on(&self, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, "proxy listening"),
            Err(e) => warn!(error = %e, "proxy listening on unknown address"),
        }

        loop {
            let (client, client_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "TCP accept error");
                    continue;
                }
            };

            let config = self.config.clone();
            let tunnels = Arc::clone(&self.tunnels);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(client, client_addr, &config, &tunnels).await {
                    debug!(client = %client_addr, error = %e, "connection ended with error");
                }
            });
        }
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::Bind { addr, source: e })
}

/// Serve one client connection: read its request and dispatch on method.
///
/// The client and any upstream stream are dropped when this returns.
async fn handle_connection(
    mut client: TcpStream,
    client_addr: SocketAddr,
    config: &ProxyConfig,
    tunnels: &TunnelIds,
) -> Result<()> {
    let (head, leftover) = match RequestHead::read(&mut client, config.request_timeout).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            trace!(client = %client_addr, "connection closed before a request");
            return Ok(());
        }
        Err(ProxyError::InvalidRequest(detail)) => {
            info!(client = %client_addr.ip(), %detail, "rejected malformed request");
            send_error(&mut client, ErrorStatus::BadRequest, "Malformed request").await?;
            return Err(ProxyError::InvalidRequest(detail));
        }
        Err(e) => return Err(e),
    };

    trace!(client = %client_addr, method = %head.method, uri = %head.target, "request");

    if head.is_connect() {
        handle_connect(&mut client, client_addr, &head.target, &leftover, config, tunnels).await?;
    } else {
        handle_forward(&mut client, client_addr, &head, &leftover, config).await?;
    }

    Ok(())
}
