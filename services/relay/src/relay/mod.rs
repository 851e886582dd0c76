//! Byte-blind TCP relay.
//!
//! This module provides:
//! - TCP listener with per-connection dispatch
//! - Connection supervision (upstream connect, forwarder pair)
//! - Directional forwarding with symmetric destination shutdown
//! - Aggregate counters
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> ConnectionSupervisor -> Upstream
//!                              |
//!              Forwarder (client->upstream)
//!              Forwarder (upstream->client)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use revtun_relay::{Listener, ListenerConfig, Upstream};
//!
//! let config = ListenerConfig::new("0.0.0.0:8888".parse()?, Upstream::new("127.0.0.1", 9005));
//! let listener = Listener::bind(config).await?;
//! listener.run().await?;
//! ```

mod forwarder;
mod listener;
mod stats;
mod supervisor;

pub use forwarder::{
    Destination, Direction, ForwardReport, Forwarder, ForwarderState, Termination,
    DEFAULT_CHUNK_SIZE,
};
pub use listener::{Listener, ListenerConfig, DEFAULT_BACKLOG};
pub use stats::{RelayStats, StatsSnapshot};
pub use supervisor::{Connection, ConnectionSupervisor, SupervisorConfig, Upstream};
