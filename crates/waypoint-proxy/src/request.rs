//! Proxy request head parsing.
//!
//! Reads an HTTP/1.x request head from the client with `httparse`. Bytes the
//! client sent past the end of the head are returned alongside it so the
//! tunnel and forward paths can pass them on.

use crate::{ProxyError, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest request head accepted from a client.
pub const HEADER_SECTION_MAX_LENGTH: usize = 8192;

/// Largest number of header fields accepted in one request.
const MAX_HEADERS: usize = 64;

/// A single header field as received, value bytes untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

/// Parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Request method, e.g. `CONNECT` or `GET`.
    pub method: String,
    /// Request target as sent (authority form or absolute URI).
    pub target: String,
    /// Minor HTTP version (`1` for HTTP/1.1).
    pub version: u8,
    /// Header fields in received order; repeated names are kept.
    pub headers: Vec<Header>,
}

impl RequestHead {
    /// Parse a request head from `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete head,
    /// otherwise the head and the number of bytes it occupies.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(ProxyError::InvalidRequest(e.to_string())),
        };

        let method = req
            .method
            .ok_or_else(|| ProxyError::InvalidRequest("missing method".to_string()))?;
        let target = req
            .path
            .ok_or_else(|| ProxyError::InvalidRequest("missing request target".to_string()))?;
        let version = req
            .version
            .ok_or_else(|| ProxyError::InvalidRequest("missing HTTP version".to_string()))?;

        let headers = req
            .headers
            .iter()
            .map(|h| Header {
                name: h.name.to_string(),
                value: h.value.to_vec(),
            })
            .collect();

        Ok(Some((
            Self {
                method: method.to_string(),
                target: target.to_string(),
                version,
                headers,
            },
            len,
        )))
    }

    /// Read one request head from `reader`.
    ///
    /// The whole head must arrive within `timeout`. Returns `Ok(None)` if the
    /// peer closes the connection before sending anything. On success, any
    /// bytes received after the head are returned with it.
    pub async fn read<R>(reader: &mut R, timeout: Duration) -> Result<Option<(Self, Vec<u8>)>>
    where
        R: AsyncRead + Unpin,
    {
        match tokio::time::timeout(timeout, Self::read_unbounded(reader)).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out waiting for request head",
            ))),
        }
    }

    async fn read_unbounded<R>(reader: &mut R) -> Result<Option<(Self, Vec<u8>)>>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = Vec::with_capacity(1024);
        let mut chunk = [0u8; 1024];

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::InvalidRequest(
                    "connection closed mid request head".to_string(),
                ));
            }
            buf.extend_from_slice(&chunk[..n]);

            if let Some((head, len)) = Self::parse(&buf)? {
                let leftover = buf.split_off(len);
                return Ok(Some((head, leftover)));
            }

            if buf.len() >= HEADER_SECTION_MAX_LENGTH {
                return Err(ProxyError::InvalidRequest(format!(
                    "request head exceeds {HEADER_SECTION_MAX_LENGTH} bytes"
                )));
            }
        }
    }

    /// True for `CONNECT` requests.
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Value of the first header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_slice())
    }

    /// Declared `Content-Length`, if present and well formed.
    pub fn content_length(&self) -> Option<u64> {
        let value = self.header("Content-Length")?;
        std::str::from_utf8(value).ok()?.trim().parse().ok()
    }
}
