//! h2c-speed: HTTP/1.1 vs cleartext HTTP/2 throughput comparison
//!
//! Runs two matched servers, one speaking HTTP/1.1 and one speaking HTTP/2
//! without TLS (h2c), then downloads a large random payload from each with a
//! matched client so the protocol layer is the only variable.
//!
//! Modes:
//! - default: start both servers, download from each in turn, exit
//! - `-s`: server only, serve until interrupted (test with curl or similar)
//! - `-u <url>`: client only, download one URL (`--h2c` for HTTP/2)

mod bench;
mod client;
mod config;
mod format;
mod metrics;
mod payload;
mod protocol;
mod server;
mod stream;

use config::Config;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        mode = ?config.mode,
        host = %config.host,
        http1_port = config.http1_port,
        h2c_port = config.h2c_port,
        test_size = config.test_size,
        seed = config.seed,
        "Starting h2c-speed"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let cancel = CancellationToken::new();

        let on_signal = cancel.clone();
        tokio::spawn(async move {
            bench::shutdown_signal().await;
            info!("Shutdown signal received");
            on_signal.cancel();
        });

        bench::run(config, cancel).await.map_err(|e| {
            error!(error = %e, "Fatal error");
            e
        })
    })
}
