//! revtun relay
//!
//! Reverse tunnel TCP relay.
//!
//! This service:
//! - Accepts TCP connections on a fixed local address
//! - Opens one upstream connection per client to a fixed remote address
//! - Copies bytes both ways until either side closes or errors
//!
//! The relay never inspects the payload.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use revtun_relay::{logging, Config, Listener};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    logging::init(&config.log_level, config.log_format);

    let listener_config = config
        .listener_config()
        .await
        .context("Invalid relay configuration")?;

    info!(
        bind_addr = %listener_config.bind_addr,
        upstream = %listener_config.upstream,
        chunk_size = listener_config.chunk_size,
        connect_timeout = ?listener_config.connect_timeout,
        idle_timeout = ?listener_config.idle_timeout,
        max_connections = ?listener_config.max_connections,
        "Configuration loaded"
    );

    let bind_addr = listener_config.bind_addr;
    let upstream = listener_config.upstream.clone();

    let listener = match Listener::bind(listener_config).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(bind_addr = %bind_addr, error = %e, "Failed to bind listener");
            return Err(e).context("Relay startup failed");
        }
    };

    info!("relay listening on {} ==> {}", listener.local_addr()?, upstream);

    listener.run().await.context("Listener stopped")
}
