//! OneMcp Gateway
//!
//! A single MCP server facade over many upstream MCP servers:
//! - Outbound connection pool with supervised reconnection
//! - Per-session capability aggregation with tag filters and namespacing
//! - Live configuration reload with minimal connection churn
//! - List-changed notification fanout to affected sessions
//! - Scope authorization and a file-backed token store

pub mod aggregator;
pub mod auth;
pub mod error;
pub mod naming;
pub mod notify;
pub mod pool;
pub mod registry;
pub mod reload;
pub mod server;
pub mod session;

pub use error::GatewayError;
pub use naming::{qualify, split_qualified};
pub use notify::NotificationFanout;
pub use pool::{
    Backoff, ClientManager, ConnectOutcome, OutboundClient, OutboundConnection,
};
pub use registry::{ServerAdapter, ServerRegistry, TemplateServerManager};
pub use reload::ConfigReloadService;
pub use server::{GatewayConfig, GatewayServer};
pub use session::{InboundSession, SessionManager, SessionParams};
