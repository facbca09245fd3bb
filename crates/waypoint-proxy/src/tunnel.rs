//! CONNECT tunnel establishment.
//!
//! # Tunnel Flow
//!
//! ```text
//! CONNECT host:port
//!         |
//!         v
//! parse authority --(malformed)--> 400
//!         |
//!         v
//! connect upstream (bounded) --(failed)--> 502
//!         |
//!         v
//! allocate tunnel id, log open
//!         |
//!         v
//! "200 Connection Established"
//!         |
//!         v
//! relay until close / reset / idle, log close
//! ```

use crate::relay::{relay, RelayEnd, RelayOutcome, Side};
use crate::response::{send_error, ErrorStatus, CONNECTION_ESTABLISHED};
use crate::{HumanBytes, HumanRate, ProxyConfig, ProxyError, Result, TunnelIds};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// A `host:port` pair naming a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    /// Host name or IP literal, without IPv6 brackets.
    pub host: String,
    pub port: u16,
}

impl Authority {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a CONNECT request target.
    ///
    /// Accepts `host:port` and `[ipv6]:port`. The port must be non-zero.
    pub fn parse(target: &str) -> Result<Self> {
        let invalid = |reason: &str| ProxyError::InvalidTarget {
            target: target.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = if let Some(rest) = target.strip_prefix('[') {
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| invalid("expected host:port"))?;
            (host, port)
        } else {
            let (host, port) = target
                .rsplit_once(':')
                .ok_or_else(|| invalid("expected host:port"))?;
            if host.contains(':') {
                return Err(invalid("IPv6 hosts must be bracketed"));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;
        if port == 0 {
            return Err(invalid("invalid port"));
        }

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Connect to the destination, resolving the host name if needed.
///
/// Resolution and connection together are bounded by `timeout`.
pub(crate) async fn connect_upstream(authority: &Authority, timeout: Duration) -> Result<TcpStream> {
    let connect = TcpStream::connect((authority.host.as_str(), authority.port));

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::TcpConnection {
            target: authority.to_string(),
            source: e,
        }),
        Err(_) => Err(ProxyError::TcpConnection {
            target: authority.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out"),
        }),
    }
}

/// Accounting for one finished tunnel.
#[derive(Debug)]
pub struct TunnelSummary {
    pub id: u64,
    pub authority: Authority,
    /// Bytes relayed in both directions, including any the client pipelined
    /// behind the CONNECT head.
    pub transferred: u64,
    /// Time from the upstream connect attempt to the end of the relay.
    pub duration: Duration,
    pub end: RelayEnd,
}

/// Handle a CONNECT request for `target` on an accepted client stream.
///
/// `leftover` holds bytes the client sent after the request head; they are
/// delivered upstream ahead of the relay. The upstream connection is dropped
/// before this returns, whatever the outcome.
///
/// # Errors
/// * `ProxyError::InvalidTarget` - `target` is not `host:port` (client got 400).
/// * `ProxyError::TcpConnection` - Upstream connect failed (client got 502).
/// * `ProxyError::Io` - The error response could not be written.
pub async fn handle_connect<S>(
    client: &mut S,
    client_addr: SocketAddr,
    target: &str,
    leftover: &[u8],
    config: &ProxyConfig,
    tunnels: &TunnelIds,
) -> Result<TunnelSummary>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = match Authority::parse(target) {
        Ok(authority) => authority,
        Err(e) => {
            info!(client = %client_addr.ip(), path = target, "rejected malformed CONNECT target");
            send_error(client, ErrorStatus::BadRequest, "Invalid CONNECT target").await?;
            return Err(e);
        }
    };

    let start = Instant::now();

    let mut upstream = match connect_upstream(&authority, config.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(client = %client_addr.ip(), error = %e, "tunnel connect failed");
            send_error(client, ErrorStatus::BadGateway, "Upstream connection failed").await?;
            return Err(e);
        }
    };

    let id = tunnels.allocate();
    info!(
        tunnel = id,
        client = %client_addr.ip(),
        host = %authority.host,
        port = authority.port,
        "tunnel open"
    );

    let outcome = open_and_relay(client, &mut upstream, leftover, config.idle_timeout).await;
    drop(upstream);

    let duration = start.elapsed();
    let transferred = HumanBytes::from(outcome.transferred);

    match &outcome.end {
        RelayEnd::Reset(side) => {
            warn!(tunnel = id, ?side, %transferred, "tunnel aborted: connection reset by peer");
        }
        RelayEnd::Failed(side, e) => {
            debug!(tunnel = id, ?side, error = %e, "tunnel relay error");
        }
        RelayEnd::IdleTimeout => debug!(tunnel = id, "tunnel idle timeout"),
        RelayEnd::Closed(side) => debug!(tunnel = id, ?side, "tunnel peer closed"),
    }

    info!(
        tunnel = id,
        duration = format_args!("{:.2}s", duration.as_secs_f64()),
        %transferred,
        avg_rate = %HumanRate::new(outcome.transferred, duration),
        "tunnel closed"
    );

    Ok(TunnelSummary {
        id,
        authority,
        transferred: outcome.transferred,
        duration,
        end: outcome.end,
    })
}

/// Confirm the tunnel to the client, flush pipelined bytes upstream, relay.
async fn open_and_relay<S>(
    client: &mut S,
    upstream: &mut TcpStream,
    leftover: &[u8],
    idle_timeout: Duration,
) -> RelayOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = client.write_all(CONNECTION_ESTABLISHED).await {
        return RelayOutcome {
            transferred: 0,
            end: RelayEnd::from_io(Side::Client, e),
        };
    }

    if !leftover.is_empty() {
        if let Err(e) = upstream.write_all(leftover).await {
            return RelayOutcome {
                transferred: 0,
                end: RelayEnd::from_io(Side::Upstream, e),
            };
        }
    }

    let mut outcome = relay(client, upstream, idle_timeout).await;
    outcome.transferred += leftover.len() as u64;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::net::TcpListener;

    async fn tcp_listener_or_skip(addr: &str) -> Option<TcpListener> {
        match TcpListener::bind(addr).await {
            Ok(listener) => Some(listener),
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => None,
            Err(err) => panic!("Failed to bind TCP listener for test: {err}"),
        }
    }

    /// Start an echo server accepting any number of connections.
    async fn spawn_echo_server() -> Option<SocketAddr> {
        let listener = tcp_listener_or_skip("127.0.0.1:0").await?;
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        Some(addr)
    }

    /// An address on which nothing is listening.
    async fn closed_port() -> Option<SocketAddr> {
        let listener = tcp_listener_or_skip("127.0.0.1:0").await?;
        Some(listener.local_addr().unwrap())
    }

    fn test_config() -> ProxyConfig {
        ProxyConfig {
            connect_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn client_addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    async fn read_established(client: &mut DuplexStream) {
        let mut buf = vec![0u8; CONNECTION_ESTABLISHED.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, CONNECTION_ESTABLISHED);
    }

    // ========================================================================
    // Authority Parsing Tests
    // ========================================================================

    #[test]
    fn test_authority_parse_host_port() {
        let a = Authority::parse("example.test:443").unwrap();
        assert_eq!(a, Authority::new("example.test", 443));
    }

    #[test]
    fn test_authority_parse_ipv4() {
        let a = Authority::parse("127.0.0.1:9").unwrap();
        assert_eq!(a.host, "127.0.0.1");
        assert_eq!(a.port, 9);
    }

    #[test]
    fn test_authority_parse_bracketed_ipv6() {
        let a = Authority::parse("[::1]:8443").unwrap();
        assert_eq!(a.host, "::1");
        assert_eq!(a.port, 8443);
        assert_eq!(a.to_string(), "[::1]:8443");
    }

    #[test]
    fn test_authority_parse_rejects_malformed() {
        for target in [
            "example.test",
            "example.test:",
            ":443",
            "example.test:https",
            "example.test:70000",
            "example.test:0",
            "::1:443",
            "[::1]443",
            "[::1",
            "/path",
        ] {
            let err = Authority::parse(target).unwrap_err();
            assert!(
                matches!(err, ProxyError::InvalidTarget { .. }),
                "{target} should be rejected"
            );
        }
    }

    #[test]
    fn test_authority_display() {
        assert_eq!(Authority::new("example.test", 80).to_string(), "example.test:80");
    }

    // ========================================================================
    // Connect Tests
    // ========================================================================

    #[tokio::test]
    async fn test_connect_upstream_refused() {
        let Some(addr) = closed_port().await else {
            return;
        };
        let authority = Authority::new("127.0.0.1", addr.port());
        let err = connect_upstream(&authority, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::TcpConnection { .. }));
    }

    // ========================================================================
    // Tunnel Tests
    // ========================================================================

    #[tokio::test]
    async fn test_tunnel_established_before_relayed_bytes() {
        // Upstream speaks first, so any ordering bug would put its banner
        // ahead of the 200 line.
        let Some(listener) = tcp_listener_or_skip("127.0.0.1:0").await else {
            return;
        };
        let upstream_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"SSH-2.0-banner\r\n").await.unwrap();
            let mut sink = Vec::new();
            let _ = socket.read_to_end(&mut sink).await;
        });

        let (mut proxy_side, mut client) = duplex(64 * 1024);
        let tunnels = Arc::new(TunnelIds::new());
        let task_tunnels = Arc::clone(&tunnels);
        let target = upstream_addr.to_string();

        let task = tokio::spawn(async move {
            handle_connect(
                &mut proxy_side,
                client_addr(),
                &target,
                &[],
                &test_config(),
                &task_tunnels,
            )
            .await
        });

        read_established(&mut client).await;
        let mut banner = [0u8; 16];
        client.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"SSH-2.0-banner\r\n");

        drop(client);
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.id, 1);
        assert_eq!(summary.transferred, 16);
        assert_eq!(tunnels.issued(), 1);
    }

    #[tokio::test]
    async fn test_tunnel_connect_failure_replies_bad_gateway() {
        let Some(addr) = closed_port().await else {
            return;
        };
        let (mut proxy_side, mut client) = duplex(4096);
        let tunnels = TunnelIds::new();

        let result = handle_connect(
            &mut proxy_side,
            client_addr(),
            &addr.to_string(),
            &[],
            &test_config(),
            &tunnels,
        )
        .await;
        drop(proxy_side);

        assert!(matches!(result, Err(ProxyError::TcpConnection { .. })));
        assert_eq!(tunnels.issued(), 0);

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    }

    #[tokio::test]
    async fn test_tunnel_malformed_target_replies_bad_request() {
        let (mut proxy_side, mut client) = duplex(4096);
        let tunnels = TunnelIds::new();

        let result = handle_connect(
            &mut proxy_side,
            client_addr(),
            "no-port-here",
            &[],
            &test_config(),
            &tunnels,
        )
        .await;
        drop(proxy_side);

        assert!(matches!(result, Err(ProxyError::InvalidTarget { .. })));
        assert_eq!(tunnels.issued(), 0);

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_tunnel_forwards_pipelined_bytes() {
        let Some(echo_addr) = spawn_echo_server().await else {
            return;
        };
        let (mut proxy_side, mut client) = duplex(64 * 1024);
        let tunnels = Arc::new(TunnelIds::new());
        let task_tunnels = Arc::clone(&tunnels);

        let task = tokio::spawn(async move {
            handle_connect(
                &mut proxy_side,
                client_addr(),
                &echo_addr.to_string(),
                b"early",
                &test_config(),
                &task_tunnels,
            )
            .await
        });

        read_established(&mut client).await;
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"early");

        drop(client);
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.transferred, 10);
        assert!(matches!(summary.end, RelayEnd::Closed(Side::Client)));
    }

    #[tokio::test]
    async fn test_tunnel_upstream_reset_mid_relay() {
        let Some(listener) = tcp_listener_or_skip("127.0.0.1:0").await else {
            return;
        };
        let upstream_addr = listener.local_addr().unwrap();

        // Upstream sends a banner, takes three bytes, then aborts with RST.
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"banner").await.unwrap();
            let mut buf = [0u8; 3];
            socket.read_exact(&mut buf).await.unwrap();
            socket.set_linger(Some(Duration::ZERO)).unwrap();
            drop(socket);
        });

        let (mut proxy_side, mut client) = duplex(4096);
        let tunnels = Arc::new(TunnelIds::new());
        let task_tunnels = Arc::clone(&tunnels);

        let task = tokio::spawn(async move {
            handle_connect(
                &mut proxy_side,
                client_addr(),
                &upstream_addr.to_string(),
                &[],
                &test_config(),
                &task_tunnels,
            )
            .await
        });

        read_established(&mut client).await;
        let mut banner = [0u8; 6];
        client.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"banner");
        client.write_all(b"abc").await.unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("tunnel should end on reset")
            .unwrap()
            .unwrap();
        assert_eq!(summary.id, 1);
        assert!(
            matches!(summary.end, RelayEnd::Reset(Side::Upstream)),
            "unexpected end: {:?}",
            summary.end
        );
        assert_eq!(summary.transferred, 9);
        assert_eq!(tunnels.issued(), 1);
    }

    #[tokio::test]
    async fn test_tunnel_idle_timeout_closes() {
        let Some(echo_addr) = spawn_echo_server().await else {
            return;
        };
        let (mut proxy_side, mut client) = duplex(4096);
        let tunnels = TunnelIds::new();
        let config = ProxyConfig {
            idle_timeout: Duration::from_millis(200),
            ..test_config()
        };

        let start = Instant::now();
        let summary = handle_connect(
            &mut proxy_side,
            client_addr(),
            &echo_addr.to_string(),
            &[],
            &config,
            &tunnels,
        )
        .await
        .unwrap();

        assert!(matches!(summary.end, RelayEnd::IdleTimeout));
        assert_eq!(summary.transferred, 0);
        assert!(start.elapsed() < Duration::from_secs(2));
        read_established(&mut client).await;
    }

    /// Open a tunnel to `echo_addr`, push `size` bytes through it and read
    /// them back, then hang up.
    async fn echo_through_tunnel(
        echo_addr: SocketAddr,
        size: usize,
        tunnels: Arc<TunnelIds>,
    ) -> TunnelSummary {
        let (mut proxy_side, mut client) = duplex(64 * 1024);
        let target = echo_addr.to_string();

        let task = tokio::spawn(async move {
            handle_connect(
                &mut proxy_side,
                client_addr(),
                &target,
                &[],
                &test_config(),
                &tunnels,
            )
            .await
        });

        read_established(&mut client).await;

        let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
        client.write_all(&payload).await.unwrap();
        let mut echoed = vec![0u8; size];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        drop(client);
        task.await.unwrap().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_concurrent_tunnels_count_both_directions() {
        let Some(echo_a) = spawn_echo_server().await else {
            return;
        };
        let Some(echo_b) = spawn_echo_server().await else {
            return;
        };
        let tunnels = Arc::new(TunnelIds::new());

        let (a, b) = tokio::join!(
            echo_through_tunnel(echo_a, 10_000, Arc::clone(&tunnels)),
            echo_through_tunnel(echo_b, 10_000, Arc::clone(&tunnels)),
        );

        assert_eq!(a.transferred, 20_000);
        assert_eq!(b.transferred, 20_000);
        assert_ne!(a.id, b.id);
        let mut ids = [a.id, b.id];
        ids.sort_unstable();
        assert_eq!(ids, [1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tunnel_ids_are_one_to_n() {
        let Some(echo_addr) = spawn_echo_server().await else {
            return;
        };
        let tunnels = Arc::new(TunnelIds::new());
        const N: u64 = 32;

        let tasks: Vec<_> = (0..N)
            .map(|_| {
                let tunnels = Arc::clone(&tunnels);
                tokio::spawn(echo_through_tunnel(echo_addr, 512, tunnels))
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            let summary = task.await.unwrap();
            assert_eq!(summary.transferred, 1024);
            ids.push(summary.id);
        }
        ids.sort_unstable();

        assert_eq!(ids, (1..=N).collect::<Vec<_>>());
        assert_eq!(tunnels.issued(), N);
    }
}
