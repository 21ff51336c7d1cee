//! OneMcp core domain logic.
//!
//! Everything protocol-independent lives here: the outbound server
//! configuration model and its loader/watcher, tag filters and presets,
//! template rendering, and the domain event bus the gateway is driven by.

pub mod config;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod presets;
pub mod tags;
pub mod template;

pub use config::loader::ConfigLoader;
pub use config::params::{ConfigDiff, OauthParams, OutboundConfig, ServerParams, TransportKind};
pub use config::watcher::ConfigWatcher;
pub use error::ConfigError;
pub use event::{CapabilityKind, DomainEvent, UpstreamStatus};
pub use event_bus::{EventBus, EventReceiver, EventSender};
pub use presets::PresetStore;
pub use tags::{TagExpr, TagFilter};
pub use template::TemplateContext;
