pub mod config;
pub mod error;
pub mod logging;
pub mod relay;

pub use config::{Config, LogFormat};
pub use error::RelayError;
pub use relay::{
    Connection, ConnectionSupervisor, Destination, Direction, ForwardReport, Forwarder,
    ForwarderState, Listener, ListenerConfig, RelayStats, StatsSnapshot, SupervisorConfig,
    Termination, Upstream,
};
