//! Outbound connection pool: transports, clients, supervised reconnection.

mod backoff;
mod client;
mod connection;
mod manager;
mod transport;

pub use backoff::Backoff;
pub use client::{OutboundClient, OutboundClientHandler, UpstreamCallError};
pub use connection::OutboundConnection;
pub use manager::ClientManager;
pub(crate) use manager::spawn_supervisor;
pub use transport::{connect_upstream, ConnectOutcome};

use std::time::Duration;

/// Default deadline for a single upstream RPC.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Keepalive probe interval for established connections.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive heartbeat failures treated as a transport close.
pub const HEARTBEAT_FAILURE_LIMIT: u32 = 2;

/// Drain budget when shutting a connection down.
pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);
