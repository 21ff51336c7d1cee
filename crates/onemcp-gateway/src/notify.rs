//! Notification fanout: `list_changed` delivery to affected sessions.
//!
//! Consumes the domain event bus. An upstream's `list_changed` reaches the
//! sessions whose filter admits that upstream; a reload diff fans all three
//! kinds out to sessions the change touches. Delivery is best-effort and
//! per-session failures never affect other sessions. Repeats for the same
//! `(session, kind)` inside the coalescing window collapse to one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use onemcp_core::{CapabilityKind, ConfigDiff, DomainEvent, EventReceiver};

use crate::pool::ClientManager;
use crate::session::{InboundSession, SessionManager};

/// Coalescing window per `(session, kind)` pair.
const COALESCE_WINDOW: Duration = Duration::from_millis(50);

/// Fans upstream changes out to downstream sessions.
pub struct NotificationFanout {
    sessions: Arc<SessionManager>,
    manager: Arc<ClientManager>,
    last_sent: Mutex<HashMap<(String, CapabilityKind), Instant>>,
}

impl NotificationFanout {
    pub fn new(sessions: Arc<SessionManager>, manager: Arc<ClientManager>) -> Self {
        Self {
            sessions,
            manager,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the consumer loop.
    pub fn start(self: Arc<Self>, mut events: EventReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("notification fanout started");
            while let Some(event) = events.recv().await {
                self.handle_event(event).await;
            }
            debug!("event bus closed, fanout stopping");
        })
    }

    async fn handle_event(&self, event: DomainEvent) {
        match event {
            DomainEvent::ListChanged { name, kind } => {
                self.fan_out_for_upstream(&name, &[kind]).await;
            }
            DomainEvent::ConfigReloaded { diff } => {
                self.fan_out_for_reload(&diff).await;
            }
            _ => {}
        }
    }

    /// Sessions whose filter admits `upstream` get the listed kinds.
    async fn fan_out_for_upstream(&self, upstream: &str, kinds: &[CapabilityKind]) {
        let Some(tags) = self
            .manager
            .config()
            .get(upstream)
            .map(|params| params.tags.clone())
        else {
            debug!(upstream = %upstream, "change for upstream not in config, skipping");
            return;
        };

        for session in self.sessions.active() {
            if !session.filter.matches(&tags) {
                continue;
            }
            for kind in kinds {
                self.notify(&session, *kind).await;
            }
        }
    }

    /// A reload touches sessions that admit any changed upstream. Tags for
    /// removed upstreams are gone with the old snapshot, so removals are
    /// delivered to every session.
    async fn fan_out_for_reload(&self, diff: &ConfigDiff) {
        let config = self.manager.config();
        let sessions = self.sessions.active();

        for session in sessions {
            let affected = !diff.removed.is_empty()
                || diff
                    .added
                    .iter()
                    .chain(diff.mutated.iter())
                    .any(|name| {
                        config
                            .get(name)
                            .is_some_and(|params| session.filter.matches(&params.tags))
                    });
            if !affected {
                continue;
            }
            for kind in CapabilityKind::ALL {
                self.notify(&session, kind).await;
            }
        }
    }

    /// Send one notification unless an identical one went out within the
    /// coalescing window.
    async fn notify(&self, session: &InboundSession, kind: CapabilityKind) {
        {
            let mut last_sent = self.last_sent.lock();
            let key = (session.id.clone(), kind);
            let now = Instant::now();
            if let Some(sent_at) = last_sent.get(&key) {
                if now.duration_since(*sent_at) < COALESCE_WINDOW {
                    debug!(session_id = %session.id, kind = ?kind, "coalesced notification");
                    return;
                }
            }
            last_sent.insert(key, now);
        }

        let Some(peer) = session.peer() else {
            debug!(session_id = %session.id, "session has no peer yet, skipping notification");
            return;
        };

        let result = match kind {
            CapabilityKind::Tools => peer.notify_tool_list_changed().await,
            CapabilityKind::Prompts => peer.notify_prompt_list_changed().await,
            CapabilityKind::Resources => peer.notify_resource_list_changed().await,
        };
        match result {
            Ok(()) => debug!(session_id = %session.id, kind = ?kind, "sent list_changed"),
            Err(e) => warn!(
                session_id = %session.id,
                kind = ?kind,
                error = ?e,
                "failed to deliver list_changed"
            ),
        }
    }
}
