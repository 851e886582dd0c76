//! Per-connection supervision.
//!
//! The supervisor turns an accepted client socket into a live connection:
//! connect upstream, split both sockets, and spawn one [`Forwarder`] per
//! direction. It returns as soon as both are spawned. Closing the sockets is
//! left to the forwarders (each closes its destination).

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument, Span};

use super::forwarder::{Destination, Direction, ForwardReport, Forwarder, DEFAULT_CHUNK_SIZE};
use super::stats::RelayStats;
use crate::error::RelayError;

/// The fixed remote the relay forwards to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Upstream {
    host: String,
    port: u16,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Open a connection to the upstream.
    ///
    /// Hostnames are resolved on every call. Without `connect_timeout` this
    /// waits for the OS to report success or failure.
    pub async fn connect(
        &self,
        connect_timeout: Option<Duration>,
    ) -> Result<TcpStream, RelayError> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));

        let result = match connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(RelayError::UpstreamConnectTimeout {
                        addr: self.to_string(),
                        timeout: limit,
                    })
                }
            },
            None => connect.await,
        };

        result.map_err(|source| RelayError::UpstreamConnect {
            addr: self.to_string(),
            source,
        })
    }
}

impl From<SocketAddr> for Upstream {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Bytes read per forwarder iteration.
    pub chunk_size: usize,
    /// Upstream connect bound. `None` waits for the OS.
    pub connect_timeout: Option<Duration>,
    /// Per-read bound in each direction. `None` never times out.
    pub idle_timeout: Option<Duration>,
    /// Set TCP_NODELAY on both sockets.
    pub nodelay: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: None,
            idle_timeout: None,
            nodelay: false,
        }
    }
}

/// Establishes connections and hands them to a forwarder pair.
pub struct ConnectionSupervisor {
    upstream: Upstream,
    config: SupervisorConfig,
    stats: Arc<RelayStats>,
}

impl ConnectionSupervisor {
    pub fn new(upstream: Upstream, config: SupervisorConfig, stats: Arc<RelayStats>) -> Self {
        Self {
            upstream,
            config,
            stats,
        }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Connect upstream for `client` and start relaying.
    ///
    /// On connect failure the client socket is closed and the error returned;
    /// nothing is retried. On success both forwarders are already running
    /// when this returns.
    pub async fn start(
        &self,
        client: TcpStream,
        peer: SocketAddr,
    ) -> Result<Connection, RelayError> {
        self.start_admitted(client, peer, None).await
    }

    /// Like [`start`](Self::start), holding `permit` until the connection closes.
    pub(crate) async fn start_admitted(
        &self,
        client: TcpStream,
        peer: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<Connection, RelayError> {
        let upstream = match self.upstream.connect(self.config.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.upstream_failed.fetch_add(1, Ordering::Relaxed);
                drop(client);
                return Err(e);
            }
        };

        if self.config.nodelay {
            for stream in [&client, &upstream] {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Failed to set TCP_NODELAY");
                }
            }
        }

        debug!(
            upstream = %self.upstream,
            upstream_local = ?upstream.local_addr().ok(),
            "Connected to upstream"
        );

        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let guard = Arc::new(ConnectionGuard::open(peer, Arc::clone(&self.stats), permit));

        let outbound = Forwarder::new(Direction::ClientToUpstream, client_read, upstream_write)
            .with_chunk_size(self.config.chunk_size)
            .with_idle_timeout(self.config.idle_timeout);
        let inbound = Forwarder::new(Direction::UpstreamToClient, upstream_read, client_write)
            .with_chunk_size(self.config.chunk_size)
            .with_idle_timeout(self.config.idle_timeout);

        let span = Span::current();
        let outbound =
            tokio::spawn(run_tracked(outbound, Arc::clone(&guard)).instrument(span.clone()));
        let inbound = tokio::spawn(run_tracked(inbound, guard).instrument(span));

        Ok(Connection {
            peer,
            outbound,
            inbound,
        })
    }
}

async fn run_tracked<R, W>(
    forwarder: Forwarder<R, W>,
    guard: Arc<ConnectionGuard>,
) -> ForwardReport
where
    R: AsyncRead + Unpin,
    W: Destination,
{
    let report = forwarder.run().await;
    guard.record(&report);
    report
}

/// Handles to a live connection's forwarders.
///
/// Dropping this detaches the forwarders; they keep running until their
/// sockets close.
pub struct Connection {
    peer: SocketAddr,
    outbound: JoinHandle<ForwardReport>,
    inbound: JoinHandle<ForwardReport>,
}

impl Connection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Wait for both directions to terminate.
    ///
    /// Returns `(client->upstream, upstream->client)` reports.
    pub async fn closed(self) -> io::Result<(ForwardReport, ForwardReport)> {
        let (outbound, inbound) = tokio::join!(self.outbound, self.inbound);
        Ok((
            outbound.map_err(io::Error::other)?,
            inbound.map_err(io::Error::other)?,
        ))
    }
}

/// Shared by both forwarders of a connection; dropped when the last one ends.
struct ConnectionGuard {
    peer: SocketAddr,
    opened: Instant,
    stats: Arc<RelayStats>,
    bytes_to_upstream: AtomicU64,
    bytes_to_client: AtomicU64,
    permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionGuard {
    fn open(
        peer: SocketAddr,
        stats: Arc<RelayStats>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Self {
            peer,
            opened: Instant::now(),
            stats,
            bytes_to_upstream: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
            permit,
        }
    }

    fn record(&self, report: &ForwardReport) {
        let (ours, total) = match report.direction {
            Direction::ClientToUpstream => (&self.bytes_to_upstream, &self.stats.bytes_to_upstream),
            Direction::UpstreamToClient => (&self.bytes_to_client, &self.stats.bytes_to_client),
        };
        ours.fetch_add(report.bytes, Ordering::Relaxed);
        total.fetch_add(report.bytes, Ordering::Relaxed);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        // Free the admission slot before the connection stops counting as active.
        drop(self.permit.take());
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);

        info!(
            peer_addr = %self.peer,
            bytes_to_upstream = self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_to_client = self.bytes_to_client.load(Ordering::Relaxed),
            duration_ms = self.opened.elapsed().as_millis() as u64,
            "Connection closed"
        );
    }
}
