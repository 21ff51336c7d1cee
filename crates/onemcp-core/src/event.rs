//! Domain events emitted by the gateway runtime.
//!
//! Events flow through the [`crate::event_bus::EventBus`] from producers
//! (client manager, outbound client handlers, reload service) to consumers
//! (notification fanout, health surface). Producers never call consumers
//! directly; the bus is what keeps the reload/fanout/manager triangle
//! acyclic.

use serde::Serialize;

use crate::config::params::ConfigDiff;

/// Runtime status of one outbound upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum UpstreamStatus {
    /// Not connected (initial state, explicit shutdown, or `disabled: true`)
    #[default]
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Handshake complete, transport open
    Connected,
    /// Parked until an OAuth token arrives
    AwaitingOauth,
    /// Last attempt failed; the supervisor is backing off
    Error,
}

impl UpstreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamStatus::Disconnected => "disconnected",
            UpstreamStatus::Connecting => "connecting",
            UpstreamStatus::Connected => "connected",
            UpstreamStatus::AwaitingOauth => "awaiting_oauth",
            UpstreamStatus::Error => "error",
        }
    }
}

/// The three list-bearing capability kinds that emit `list_changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Tools,
    Prompts,
    Resources,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 3] = [
        CapabilityKind::Tools,
        CapabilityKind::Prompts,
        CapabilityKind::Resources,
    ];
}

/// Events distributed over the bus.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    /// An upstream connection changed status.
    UpstreamStatusChanged {
        name: String,
        status: UpstreamStatus,
        error: Option<String>,
    },
    /// An upstream sent `notifications/<kind>/list_changed`.
    ListChanged { name: String, kind: CapabilityKind },
    /// A configuration reload was applied.
    ConfigReloaded { diff: ConfigDiff },
    /// The inbound HTTP surface is listening.
    GatewayStarted { addr: String },
    /// The gateway is shutting down.
    GatewayStopped,
}

impl DomainEvent {
    /// Stable identifier used in log lines.
    pub fn type_name(&self) -> &'static str {
        match self {
            DomainEvent::UpstreamStatusChanged { .. } => "upstream_status_changed",
            DomainEvent::ListChanged { .. } => "list_changed",
            DomainEvent::ConfigReloaded { .. } => "config_reloaded",
            DomainEvent::GatewayStarted { .. } => "gateway_started",
            DomainEvent::GatewayStopped => "gateway_stopped",
        }
    }

    /// The upstream this event concerns, if any.
    pub fn upstream(&self) -> Option<&str> {
        match self {
            DomainEvent::UpstreamStatusChanged { name, .. } => Some(name),
            DomainEvent::ListChanged { name, .. } => Some(name),
            _ => None,
        }
    }
}
