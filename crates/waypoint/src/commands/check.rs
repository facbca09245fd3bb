use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use waypoint_proxy::{ProxyConfig, ProxyHandle, ProxyServer};

use crate::error::CliError;

const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn check() -> Result<(), CliError> {
    let mut all_ok = true;

    // 1. Platform info
    println!("Platform: {}", std::env::consts::OS);
    println!("Architecture: {}", std::env::consts::ARCH);

    // 2. Proxy start on an ephemeral loopback port
    print!("Proxy start: ");
    let config = ProxyConfig::bound_to(([127, 0, 0, 1], 0).into()).with_timeout(CHECK_TIMEOUT);
    let handle = match ProxyServer::new(config) {
        Ok(server) => match server.start().await {
            Ok(handle) => {
                println!("OK ({})", handle.proxy_addr());
                Some(handle)
            }
            Err(e) => {
                println!("FAIL (start): {e}");
                None
            }
        },
        Err(e) => {
            println!("FAIL (init): {e}");
            None
        }
    };

    let Some(handle) = handle else {
        return Err(CliError::Other("One or more checks failed".to_string()));
    };

    // 3. Tunnel through the proxy to a local echo listener
    print!("CONNECT tunnel: ");
    match tunnel_round_trip(&handle).await {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAIL: {e}");
            all_ok = false;
        }
    }

    // 4. Shutdown
    print!("Proxy shutdown: ");
    match handle.shutdown().await {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAIL (shutdown): {e}");
            all_ok = false;
        }
    }

    if !all_ok {
        return Err(CliError::Other("One or more checks failed".to_string()));
    }

    Ok(())
}

async fn tunnel_round_trip(handle: &ProxyHandle) -> Result<(), CliError> {
    let echo = TcpListener::bind(("127.0.0.1", 0)).await?;
    let echo_addr = echo.local_addr()?;
    let echo_task = tokio::spawn(async move {
        if let Ok((mut socket, _)) = echo.accept().await {
            let (mut r, mut w) = socket.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        }
    });

    let exchange = async {
        let mut client = TcpStream::connect(handle.proxy_addr()).await?;
        client
            .write_all(format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n").as_bytes())
            .await?;

        let mut status = vec![0u8; b"HTTP/1.1 200 Connection Established\r\n\r\n".len()];
        client.read_exact(&mut status).await?;
        if !status.starts_with(b"HTTP/1.1 200") {
            let line = String::from_utf8_lossy(&status);
            return Err(CliError::Other(format!(
                "unexpected reply: {}",
                line.lines().next().unwrap_or_default()
            )));
        }

        client.write_all(b"waypoint").await?;
        let mut echoed = [0u8; 8];
        client.read_exact(&mut echoed).await?;
        if &echoed != b"waypoint" {
            return Err(CliError::Other("tunnel corrupted payload".to_string()));
        }
        Ok(())
    };

    let result = match tokio::time::timeout(CHECK_TIMEOUT, exchange).await {
        Ok(result) => result,
        Err(_) => Err(CliError::Other("timed out".to_string())),
    };
    echo_task.abort();
    result
}
