//! Relay configuration.
//!
//! Read once at startup from flags or `REVTUN_*` environment variables and
//! immutable afterwards.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::net::lookup_host;

use crate::error::RelayError;
use crate::relay::{ListenerConfig, Upstream, DEFAULT_CHUNK_SIZE};

/// Upper bound for the per-direction transfer buffer.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// revtun relay - forward every inbound TCP connection to a fixed upstream.
#[derive(Debug, Clone, Parser)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Local host to accept client connections on (IP literal or hostname).
    #[arg(long, env = "REVTUN_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,

    /// Local port to accept client connections on.
    #[arg(long, env = "REVTUN_BIND_PORT", default_value_t = 8888)]
    pub bind_port: u16,

    /// Upstream host (IP literal or hostname).
    #[arg(long, env = "REVTUN_REMOTE_HOST", default_value = "127.0.0.1")]
    pub remote_host: String,

    /// Upstream port.
    #[arg(long, env = "REVTUN_REMOTE_PORT", default_value_t = 9005)]
    pub remote_port: u16,

    /// Bytes read per forwarder iteration.
    #[arg(long, env = "REVTUN_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// OS listen backlog.
    #[arg(long, env = "REVTUN_BACKLOG", default_value_t = 1024)]
    pub backlog: u32,

    /// Upstream connect timeout in milliseconds (unset: wait for the OS).
    #[arg(long, env = "REVTUN_CONNECT_TIMEOUT_MS")]
    pub connect_timeout_ms: Option<u64>,

    /// Per-read idle timeout in milliseconds (unset: never).
    #[arg(long, env = "REVTUN_IDLE_TIMEOUT_MS")]
    pub idle_timeout_ms: Option<u64>,

    /// Maximum concurrent connections (unset: unbounded).
    #[arg(long, env = "REVTUN_MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,

    /// Set TCP_NODELAY on both endpoints.
    #[arg(long, env = "REVTUN_NODELAY")]
    pub nodelay: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "REVTUN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format.
    #[arg(long, env = "REVTUN_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Config {
    /// Check option combinations clap cannot express.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.bind_host.trim().is_empty() {
            return Err(RelayError::Config("bind host must not be empty".into()));
        }
        if self.remote_host.trim().is_empty() {
            return Err(RelayError::Config("remote host must not be empty".into()));
        }
        if self.remote_port == 0 {
            return Err(RelayError::Config("remote port must be non-zero".into()));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(RelayError::Config(format!(
                "chunk size must be between 1 and {} bytes",
                MAX_CHUNK_SIZE
            )));
        }
        if self.backlog == 0 {
            return Err(RelayError::Config("backlog must be non-zero".into()));
        }
        if self.connect_timeout_ms == Some(0) || self.idle_timeout_ms == Some(0) {
            return Err(RelayError::Config(
                "timeouts must be non-zero when set".into(),
            ));
        }
        if self.max_connections == Some(0) {
            return Err(RelayError::Config(
                "max connections must be non-zero when set".into(),
            ));
        }
        Ok(())
    }

    /// Local listening address. Hostnames resolve once, first result wins.
    pub async fn bind_addr(&self) -> Result<SocketAddr, RelayError> {
        let host = self.bind_host.trim();
        let resolve_err = |source: io::Error| RelayError::Resolve {
            host: host.to_string(),
            source,
        };

        lookup_host((host, self.bind_port))
            .await
            .map_err(resolve_err)?
            .next()
            .ok_or_else(|| {
                resolve_err(io::Error::new(io::ErrorKind::NotFound, "no addresses"))
            })
    }

    /// Upstream target.
    pub fn upstream(&self) -> Upstream {
        Upstream::new(self.remote_host.trim(), self.remote_port)
    }

    /// Build the listener configuration.
    pub async fn listener_config(&self) -> Result<ListenerConfig, RelayError> {
        self.validate()?;

        let mut config = ListenerConfig::new(self.bind_addr().await?, self.upstream());
        config.chunk_size = self.chunk_size;
        config.backlog = self.backlog;
        config.connect_timeout = self.connect_timeout_ms.map(Duration::from_millis);
        config.idle_timeout = self.idle_timeout_ms.map(Duration::from_millis);
        config.max_connections = self.max_connections;
        config.nodelay = self.nodelay;
        Ok(config)
    }
}
