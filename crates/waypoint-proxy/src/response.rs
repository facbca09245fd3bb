//! Status responses written to proxy clients.

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Reply to a CONNECT whose upstream connection succeeded. No body follows.
pub(crate) const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Error statuses the proxy reports to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorStatus {
    BadRequest,
    BadGateway,
}

impl ErrorStatus {
    fn code(self) -> u16 {
        match self {
            ErrorStatus::BadRequest => 400,
            ErrorStatus::BadGateway => 502,
        }
    }

    fn reason(self) -> &'static str {
        match self {
            ErrorStatus::BadRequest => "Bad Request",
            ErrorStatus::BadGateway => "Bad Gateway",
        }
    }
}

/// Render a complete `Connection: close` error response with `detail` as body.
pub(crate) fn error_response(status: ErrorStatus, detail: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.code(),
        status.reason(),
        detail.len(),
        detail,
    )
    .into_bytes()
}

/// Write an error response to the client.
pub(crate) async fn send_error<W>(client: &mut W, status: ErrorStatus, detail: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    client.write_all(&error_response(status, detail)).await?;
    client.flush().await
}
