use std::net::SocketAddr;
use std::time::Duration;

use waypoint_proxy::{ProxyConfig, ProxyServer};

use crate::cli::ServeArgs;
use crate::error::CliError;

pub async fn serve(args: ServeArgs) -> Result<(), CliError> {
    let config = proxy_config(&args);
    tracing::debug!(?config, "starting proxy");

    let handle = ProxyServer::new(config)?.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!(
        tunnels = handle.tunnels_opened(),
        "interrupt received, shutting down"
    );

    handle.shutdown().await?;
    Ok(())
}

fn proxy_config(args: &ServeArgs) -> ProxyConfig {
    let timeout = Duration::from_secs(args.timeout);
    let mut config =
        ProxyConfig::bound_to(SocketAddr::new(args.bind, args.port)).with_timeout(timeout);
    if let Some(secs) = args.connect_timeout {
        config.connect_timeout = Duration::from_secs(secs);
    }
    config
}
