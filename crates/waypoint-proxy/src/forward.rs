//! Plain-HTTP forwarding.
//!
//! Handles proxy requests carrying an absolute `http://` target: the request
//! head is written to the origin unchanged (apart from the protocol version,
//! which is always HTTP/1.1), followed by any declared body, and the origin's
//! raw response is streamed back until the origin closes.
//!
//! This path never speaks TLS. `https://` targets are refused with a 400;
//! clients reach TLS origins through CONNECT.

use crate::relay::RELAY_BUFFER_SIZE;
use crate::request::RequestHead;
use crate::response::{send_error, ErrorStatus};
use crate::tunnel::{connect_upstream, Authority};
use crate::{ProxyConfig, ProxyError, Result};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use url::Url;

/// URI scheme of a forward-path target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Destination extracted from an absolute request URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub scheme: Scheme,
    pub authority: Authority,
}

impl ForwardTarget {
    /// Parse an absolute `http://` or `https://` request target.
    ///
    /// The port defaults to the scheme's well-known port.
    pub fn parse(target: &str) -> Result<Self> {
        let invalid = |reason: &str| ProxyError::InvalidTarget {
            target: target.to_string(),
            reason: reason.to_string(),
        };

        // `Url::parse` repairs `http:host` and `http:\\host`; require the slashes.
        if !has_absolute_prefix(target) {
            return Err(invalid("Absolute URI required"));
        }

        let url = Url::parse(target).map_err(|_| invalid("Absolute URI required"))?;

        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(invalid("Absolute URI required")),
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("Absolute URI required"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        Ok(Self {
            scheme,
            authority: Authority::new(host, port),
        })
    }
}

fn has_absolute_prefix(target: &str) -> bool {
    ["http://", "https://"].iter().any(|prefix| {
        target
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    })
}

/// Serialize the request head sent to the origin.
///
/// The request line keeps the client's method and target verbatim; every
/// header is written in received order with its raw value.
pub fn build_upstream_request(head: &RequestHead) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(head.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(head.target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for header in &head.headers {
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(&header.value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Forward a non-CONNECT request to its origin and stream the response back.
///
/// `leftover` holds bytes the client sent after the head; the part covered
/// by `Content-Length` is sent as the start of the request body. Returns the
/// number of response bytes delivered to the client.
///
/// # Errors
/// * `ProxyError::InvalidTarget` - Target is not an absolute `http://` URI
///   (client got 400).
/// * `ProxyError::TcpConnection` - Origin connect failed (client got 502).
/// * `ProxyError::Io` - Sending the request to the origin failed, or an error
///   response could not be written.
pub async fn handle_forward<S>(
    client: &mut S,
    client_addr: SocketAddr,
    head: &RequestHead,
    leftover: &[u8],
    config: &ProxyConfig,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = match ForwardTarget::parse(&head.target) {
        Ok(target) => target,
        Err(e) => {
            info!(client = %client_addr.ip(), path = %head.target, "rejected non-proxy request");
            send_error(client, ErrorStatus::BadRequest, "Absolute URI required").await?;
            return Err(e);
        }
    };

    if target.scheme == Scheme::Https {
        info!(client = %client_addr.ip(), path = %head.target, "rejected https request without CONNECT");
        send_error(client, ErrorStatus::BadRequest, "HTTPS requires CONNECT").await?;
        return Err(ProxyError::InvalidTarget {
            target: head.target.clone(),
            reason: "HTTPS requires CONNECT".to_string(),
        });
    }

    info!(
        client = %client_addr.ip(),
        method = %head.method,
        uri = %head.target,
        "forwarding request"
    );

    let mut upstream = match connect_upstream(&target.authority, config.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "forward connect failed");
            send_error(client, ErrorStatus::BadGateway, "Upstream connection failed").await?;
            return Err(e);
        }
    };

    if let Err(e) = send_request(client, &mut upstream, head, leftover, config.idle_timeout).await {
        warn!(error = %e, "failed to send request upstream");
        send_error(client, ErrorStatus::BadGateway, "Upstream request failed").await?;
        return Err(e.into());
    }

    let forwarded = stream_response(&mut upstream, client, config.idle_timeout).await;
    drop(upstream);

    if forwarded == 0 {
        debug!(uri = %head.target, "origin closed without a response");
    }
    info!(bytes = forwarded, "response forwarded");

    Ok(forwarded)
}

/// Write the head and declared body to the origin.
///
/// Every write to the origin must make progress within `idle_timeout`.
async fn send_request<S, U>(
    client: &mut S,
    upstream: &mut U,
    head: &RequestHead,
    leftover: &[u8],
    idle_timeout: Duration,
) -> io::Result<()>
where
    S: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    write_origin(upstream, &build_upstream_request(head), idle_timeout).await?;

    if let Some(body_len) = head.content_length() {
        let buffered = leftover.len().min(usize::try_from(body_len).unwrap_or(usize::MAX));
        write_origin(upstream, &leftover[..buffered], idle_timeout).await?;

        let remaining = body_len - buffered as u64;
        copy_body(client, upstream, remaining, idle_timeout).await?;
    }

    match tokio::time::timeout(idle_timeout, upstream.flush()).await {
        Ok(result) => result,
        Err(_) => Err(origin_stalled()),
    }
}

/// Copy exactly `remaining` body bytes from the client to the origin.
async fn copy_body<S, U>(
    client: &mut S,
    upstream: &mut U,
    mut remaining: u64,
    idle_timeout: Duration,
) -> io::Result<()>
where
    S: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    while remaining > 0 {
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = match tokio::time::timeout(idle_timeout, client.read(&mut buf[..want])).await {
            Ok(Ok(0)) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed before sending the full body",
                ))
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out reading request body",
                ))
            }
        };
        write_origin(upstream, &buf[..n], idle_timeout).await?;
        remaining -= n as u64;
    }
    Ok(())
}

async fn write_origin<U>(upstream: &mut U, bytes: &[u8], idle_timeout: Duration) -> io::Result<()>
where
    U: AsyncWrite + Unpin,
{
    match tokio::time::timeout(idle_timeout, upstream.write_all(bytes)).await {
        Ok(result) => result,
        Err(_) => Err(origin_stalled()),
    }
}

fn origin_stalled() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "origin stopped reading the request")
}

/// Stream the origin's response to the client until the origin closes.
///
/// Stops early if the origin stays silent for `idle_timeout` or a client
/// write fails. Returns the bytes delivered to the client.
async fn stream_response<U, S>(upstream: &mut U, client: &mut S, idle_timeout: Duration) -> u64
where
    U: AsyncRead + Unpin,
    S: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut forwarded: u64 = 0;

    loop {
        let n = match tokio::time::timeout(idle_timeout, upstream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!(error = %e, "origin read failed");
                break;
            }
            Err(_) => {
                debug!("origin idle, ending response");
                break;
            }
        };

        match tokio::time::timeout(idle_timeout, client.write_all(&buf[..n])).await {
            Ok(Ok(())) => forwarded += n as u64,
            Ok(Err(e)) => {
                debug!(error = %e, "client write failed");
                break;
            }
            Err(_) => {
                debug!("client stopped reading, ending response");
                break;
            }
        }
    }

    forwarded
}
