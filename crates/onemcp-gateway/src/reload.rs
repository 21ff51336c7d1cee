//! Config reload service: watcher → loader → client manager → event bus.
//!
//! Owned above the manager and the fanout so neither needs to know about
//! the other; the applied diff travels as a domain event. Reloads are
//! processed one at a time: the next watcher request is not taken until the
//! previous apply returned.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use onemcp_core::config::watcher::ReloadRequest;
use onemcp_core::{ConfigLoader, DomainEvent, EventSender, PresetStore};

use crate::pool::ClientManager;

pub struct ConfigReloadService {
    loader: Arc<ConfigLoader>,
    manager: Arc<ClientManager>,
    presets: Arc<PresetStore>,
    events: EventSender,
}

impl ConfigReloadService {
    pub fn new(
        loader: Arc<ConfigLoader>,
        manager: Arc<ClientManager>,
        presets: Arc<PresetStore>,
        events: EventSender,
    ) -> Self {
        Self {
            loader,
            manager,
            presets,
            events,
        }
    }

    /// Spawn the reload loop consuming watcher requests.
    pub fn start(self, mut reload_rx: mpsc::Receiver<ReloadRequest>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("config reload service started");
            while reload_rx.recv().await.is_some() {
                self.reload_once().await;
            }
            debug!("watcher channel closed, reload service stopping");
        })
    }

    /// One reload cycle. A malformed config is reported and discarded; the
    /// previously active snapshot stays live.
    pub async fn reload_once(&self) {
        if !self.loader.mtime_changed() {
            debug!("config file unchanged, skipping reload");
            // Presets may still have moved; they live in their own file.
            if let Err(e) = self.presets.reload() {
                warn!(error = %e, "preset reload failed, keeping previous presets");
            }
            return;
        }

        let config = match self.loader.load() {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "config reload failed, keeping active snapshot");
                return;
            }
        };

        let version = config.version;
        let diff = self.manager.apply_reload(config).await;

        if let Err(e) = self.presets.reload() {
            warn!(error = %e, "preset reload failed, keeping previous presets");
        }

        if diff.is_empty() {
            debug!(version = version, "reload applied with no connection changes");
            return;
        }

        info!(
            version = version,
            added = diff.added.len(),
            removed = diff.removed.len(),
            mutated = diff.mutated.len(),
            "configuration reloaded"
        );
        self.events.emit(DomainEvent::ConfigReloaded { diff });
    }
}
