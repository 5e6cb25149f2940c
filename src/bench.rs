//! Benchmark orchestration.
//!
//! Starts both servers, waits for them to be ready, then downloads from each
//! one in turn so the two measurements never compete for CPU or network.

use crate::client;
use crate::config::{Config, Mode};
use crate::payload::Payload;
use crate::protocol::{Protocol, Router};
use crate::server::{DualServer, Handler};
use crate::stream::{Streamer, CHUNK_SIZE};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run the configured mode to completion.
pub async fn run(
    config: Config,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Mode::ClientOnly { url, protocol } = &config.mode {
        run_download(&cancel, url, *protocol).await;
        return Ok(());
    }

    let payload = Payload::new(config.seed);
    let streamer = Streamer::new(&payload, CHUNK_SIZE)?;
    info!(
        payload = payload.capacity(),
        chunk_size = streamer.chunk_size(),
        "Payload ready"
    );
    let handler = Arc::new(Handler::new(Router::new()?, streamer));

    let mut servers = DualServer::start(
        &config.host,
        config.http1_port,
        config.h2c_port,
        handler,
        &cancel,
    );

    let (http1_addr, h2c_addr) = match servers.wait_ready().await {
        Ok(addrs) => addrs,
        Err(e) => {
            cancel.cancel();
            servers.stopped().await;
            return Err(e.into());
        }
    };
    debug!(
        http1 = ?servers.http1().phase(),
        h2c = ?servers.h2c().phase(),
        "Servers ready"
    );
    println!("server created and listening at {} ({})", http1_addr, servers.http1().protocol());
    println!("server created and listening at {} ({})", h2c_addr, servers.h2c().protocol());

    if config.mode == Mode::ServerOnly {
        println!("server mode on");
        cancel.cancelled().await;
    } else {
        let tests = [
            (config.http1_test, http1_addr, Protocol::Http1),
            (config.h2c_test, h2c_addr, Protocol::H2c),
        ];

        for (enabled, addr, protocol) in tests {
            if !enabled {
                continue;
            }
            if cancel.is_cancelled() {
                warn!("Cancelled, skipping remaining tests");
                break;
            }
            run_download(&cancel, &test_url(addr, config.test_size), protocol).await;
        }
        cancel.cancel();
    }

    servers.stopped().await;
    info!("All servers stopped");
    Ok(())
}

/// Download `url` once and print the outcome. Failures are reported, never retried.
async fn run_download(cancel: &CancellationToken, url: &str, protocol: Protocol) {
    println!("downloading {}", url);
    match client::download(cancel, url, protocol).await {
        Ok(report) => println!("{:?}: {}", report.version, report),
        Err(e) => println!("client error for {}: {}", url, e),
    }
}

/// URL of a predefined test against a local server.
fn test_url(addr: SocketAddr, size: u64) -> String {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    format!("http://{}/{}", SocketAddr::new(ip, addr.port()), size)
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
