//! Aggregate relay counters.
//!
//! Counters only. Live connections cannot be enumerated or evicted from here.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by a listener and every connection it spawns.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Total client connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections with both forwarders still running or draining.
    pub connections_active: AtomicU64,
    /// Connections whose forwarders have both terminated.
    pub connections_closed: AtomicU64,
    /// Connections dropped by the admission limit.
    pub connections_rejected: AtomicU64,
    /// Upstream connect failures and timeouts.
    pub upstream_failed: AtomicU64,
    /// Bytes relayed client -> upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed upstream -> client.
    pub bytes_to_client: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub upstream_failed: u64,
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            upstream_failed: self.upstream_failed.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }
}
