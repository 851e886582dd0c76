//! TCP listener and connection dispatch.
//!
//! The listener binds once, then accepts forever. Every accepted client is
//! handed to the [`ConnectionSupervisor`] on its own task so a slow upstream
//! connect never delays the next accept. Per-connection failures are logged
//! and go no further.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Semaphore;
use tracing::{error, info, warn, Instrument};

use super::forwarder::DEFAULT_CHUNK_SIZE;
use super::stats::RelayStats;
use super::supervisor::{ConnectionSupervisor, SupervisorConfig, Upstream};
use crate::error::RelayError;

/// Default OS listen backlog.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Where every accepted connection is relayed.
    pub upstream: Upstream,
    /// Bytes read per forwarder iteration.
    pub chunk_size: usize,
    /// OS listen backlog.
    pub backlog: u32,
    /// Upstream connect bound. `None` waits for the OS.
    pub connect_timeout: Option<Duration>,
    /// Per-read idle bound. `None` never times out.
    pub idle_timeout: Option<Duration>,
    /// Maximum concurrent connections. `None` is unbounded.
    pub max_connections: Option<usize>,
    /// Set TCP_NODELAY on both sockets of each connection.
    pub nodelay: bool,
}

impl ListenerConfig {
    /// Create a listener configuration with no timeouts and no connection limit.
    pub fn new(bind_addr: SocketAddr, upstream: Upstream) -> Self {
        Self {
            bind_addr,
            upstream,
            chunk_size: DEFAULT_CHUNK_SIZE,
            backlog: DEFAULT_BACKLOG,
            connect_timeout: None,
            idle_timeout: None,
            max_connections: None,
            nodelay: false,
        }
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            chunk_size: self.chunk_size,
            connect_timeout: self.connect_timeout,
            idle_timeout: self.idle_timeout,
            nodelay: self.nodelay,
        }
    }
}

/// Accepts clients and dispatches each to a supervisor task.
pub struct Listener {
    listener: TcpListener,
    supervisor: Arc<ConnectionSupervisor>,
    /// Present only when `max_connections` is set.
    admission: Option<Arc<Semaphore>>,
    stats: Arc<RelayStats>,
}

impl Listener {
    /// Bind the listening socket.
    ///
    /// Failure here is fatal for the process; it is never retried.
    pub async fn bind(config: ListenerConfig) -> Result<Self, RelayError> {
        let addr = config.bind_addr;
        let listener = bind_socket(addr, config.backlog)
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| RelayError::Bind { addr, source })?;

        info!(
            bind_addr = %local_addr,
            upstream = %config.upstream,
            max_connections = ?config.max_connections,
            "Listener bound"
        );

        let stats = Arc::new(RelayStats::default());
        let supervisor = ConnectionSupervisor::new(
            config.upstream.clone(),
            config.supervisor_config(),
            Arc::clone(&stats),
        );

        Ok(Self {
            listener,
            supervisor: Arc::new(supervisor),
            admission: config
                .max_connections
                .map(|limit| Arc::new(Semaphore::new(limit))),
            stats,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared counters for this listener and its connections.
    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections forever.
    ///
    /// Accept errors are logged and the loop continues; this only returns if
    /// the listening socket itself cannot report its address.
    pub async fn run(self) -> std::io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(
            bind_addr = %local_addr,
            upstream = %self.supervisor.upstream(),
            "Listener started"
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let id = self
                        .stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed)
                        + 1;

                    let permit = match &self.admission {
                        Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                            Ok(permit) => Some(permit),
                            Err(_) => {
                                self.stats
                                    .connections_rejected
                                    .fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    peer_addr = %peer_addr,
                                    "Connection rejected: max connections reached"
                                );
                                continue;
                            }
                        },
                        None => None,
                    };

                    info!(peer_addr = %peer_addr, conn_id = id, "Connection accepted");

                    let supervisor = Arc::clone(&self.supervisor);
                    tokio::spawn(
                        async move {
                            if let Err(e) =
                                supervisor.start_admitted(stream, peer_addr, permit).await
                            {
                                warn!(error = %e, "Upstream unavailable, client closed");
                            }
                        }
                        .instrument(tracing::info_span!(
                            "connection",
                            peer = %peer_addr,
                            conn_id = id
                        )),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

fn bind_socket(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    // Windows SO_REUSEADDR would let us bind over a live listener.
    #[cfg(not(windows))]
    socket.set_reuseaddr(true)?;

    socket.bind(addr)?;
    socket.listen(backlog)
}
