#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Proxy(#[from] waypoint_proxy::ProxyError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
