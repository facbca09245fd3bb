//! Bidirectional byte relay.
//!
//! Shuttles bytes between a client-facing stream and an upstream stream
//! until one of them closes, errors, or both stay silent for the idle timeout.
//!
//! # Relay Loop
//!
//! ```text
//! wait (<= idle_timeout) for a read on either side
//!         |
//!         +-- timeout        --> IdleTimeout
//!         +-- 0 bytes        --> Closed(side)
//!         +-- reset / pipe   --> Reset(side)
//!         +-- n bytes        --> write to the other side, transferred += n, loop
//! ```
//!
//! The relay borrows both streams and never closes them; dropping the
//! streams is the caller's job.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of each per-direction read buffer.
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// One of the two streams joined by a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The stream accepted from the proxy client.
    Client,
    /// The outbound stream to the destination.
    Upstream,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Client => Side::Upstream,
            Side::Upstream => Side::Client,
        }
    }
}

/// Why a relay stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// The given side reached EOF.
    Closed(Side),
    /// Neither side produced data (or accepted a write) within the idle timeout.
    IdleTimeout,
    /// The given side reset the connection or the pipe broke.
    Reset(Side),
    /// Any other I/O error on the given side.
    Failed(Side, io::Error),
}

impl RelayEnd {
    /// Classify an I/O error raised while operating on `side`.
    pub fn from_io(side: Side, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted => RelayEnd::Reset(side),
            _ => RelayEnd::Failed(side, err),
        }
    }
}

/// Result of a finished relay.
#[derive(Debug)]
pub struct RelayOutcome {
    /// Bytes written to either side, summed over both directions.
    pub transferred: u64,
    /// Termination reason.
    pub end: RelayEnd,
}

impl RelayOutcome {
    fn new(transferred: u64, end: RelayEnd) -> Self {
        Self { transferred, end }
    }
}

/// Relay bytes between `client` and `upstream` until either side finishes.
///
/// Every chunk read from one side is written verbatim to the other; bytes
/// count toward the total as soon as the destination accepts them. The call never blocks longer
/// than `idle_timeout` without progress and always reports the byte count
/// accumulated so far.
pub async fn relay<C, U>(client: &mut C, upstream: &mut U, idle_timeout: Duration) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut upstream_buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut transferred: u64 = 0;

    loop {
        let ready = tokio::time::timeout(idle_timeout, async {
            tokio::select! {
                r = client.read(&mut client_buf) => (Side::Client, r),
                r = upstream.read(&mut upstream_buf) => (Side::Upstream, r),
            }
        })
        .await;

        let (side, read) = match ready {
            Ok(ready) => ready,
            Err(_) => return RelayOutcome::new(transferred, RelayEnd::IdleTimeout),
        };

        let n = match read {
            Ok(0) => return RelayOutcome::new(transferred, RelayEnd::Closed(side)),
            Ok(n) => n,
            Err(e) => return RelayOutcome::new(transferred, RelayEnd::from_io(side, e)),
        };

        let stopped = match side {
            Side::Client => {
                write_counted(upstream, Side::Upstream, &client_buf[..n], idle_timeout, &mut transferred)
                    .await
            }
            Side::Upstream => {
                write_counted(client, Side::Client, &upstream_buf[..n], idle_timeout, &mut transferred)
                    .await
            }
        };

        if let Some(end) = stopped {
            return RelayOutcome::new(transferred, end);
        }
    }
}

/// Write `bytes` to the stream on `side`, counting every accepted chunk.
///
/// Returns why writing stopped early, or `None` once all bytes are written.
async fn write_counted<W>(
    writer: &mut W,
    side: Side,
    mut bytes: &[u8],
    idle_timeout: Duration,
    transferred: &mut u64,
) -> Option<RelayEnd>
where
    W: AsyncWrite + Unpin,
{
    while !bytes.is_empty() {
        match tokio::time::timeout(idle_timeout, writer.write(bytes)).await {
            Ok(Ok(0)) => return Some(RelayEnd::from_io(side, io::ErrorKind::WriteZero.into())),
            Ok(Ok(n)) => {
                *transferred += n as u64;
                bytes = &bytes[n..];
            }
            Ok(Err(e)) => return Some(RelayEnd::from_io(side, e)),
            // Peer stopped draining its receive buffer.
            Err(_) => return Some(RelayEnd::IdleTimeout),
        }
    }
    None
}
