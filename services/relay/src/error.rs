//! Error types for the relay.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Relay errors.
///
/// [`RelayError::Bind`], [`RelayError::Resolve`] and [`RelayError::Config`]
/// stop the process at startup. The upstream variants are scoped to a single
/// connection and never reach the listener.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Could not bind the local listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Upstream connect was refused or failed.
    #[error("could not connect to upstream {addr}: {source}")]
    UpstreamConnect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Upstream connect did not complete within the configured bound.
    #[error("upstream connect to {addr} timed out after {timeout:?}")]
    UpstreamConnectTimeout { addr: String, timeout: Duration },

    /// Bind host did not resolve to a usable address.
    #[error("could not resolve bind host {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    /// Invalid startup configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}
