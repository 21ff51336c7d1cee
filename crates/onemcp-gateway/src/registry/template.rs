//! Template connection pooling.
//!
//! Rendered template params are keyed by `name:sha256(canonical json)[..16]`,
//! so two sessions with identical renderings share one upstream connection
//! and different credentials or paths get their own. Entries are
//! reference-counted by session id; a connection whose last session left is
//! kept for an idle grace period before being torn down, so a quickly
//! reconnecting client does not respawn its upstream.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use onemcp_core::{EventSender, ServerParams, TemplateContext, UpstreamStatus};

use crate::auth::{NoopRefresher, OauthRefresher};
use crate::pool::{OutboundConnection, DEFAULT_REQUEST_TIMEOUT, SHUTDOWN_DRAIN};

/// Grace period before an unreferenced template connection is collected.
pub const IDLE_GRACE: Duration = Duration::from_secs(300);

/// GC sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct TemplateEntry {
    conn: Arc<OutboundConnection>,
    sessions: HashSet<String>,
    idle_since: Option<Instant>,
}

/// Owns every rendered-template connection.
pub struct TemplateServerManager {
    entries: RwLock<HashMap<String, TemplateEntry>>,
    events: EventSender,
    oauth: Arc<dyn OauthRefresher>,
    request_timeout: Duration,
    idle_grace: Duration,
}

impl TemplateServerManager {
    pub fn new(events: EventSender) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
            oauth: Arc::new(NoopRefresher),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            idle_grace: IDLE_GRACE,
        }
    }

    pub fn with_oauth(mut self, oauth: Arc<dyn OauthRefresher>) -> Self {
        self.oauth = oauth;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_idle_grace(mut self, grace: Duration) -> Self {
        self.idle_grace = grace;
        self
    }

    /// Connection key for a rendering: template name plus a digest of the
    /// fully rendered params.
    pub fn connection_key(rendered: &ServerParams) -> String {
        let digest = Sha256::digest(rendered.canonical_json().as_bytes());
        format!("{}:{}", rendered.name, &hex::encode(digest)[..16])
    }

    /// Render `template` for the session and return the pooled connection,
    /// creating and supervising it on first use of this rendering.
    pub async fn acquire(
        &self,
        template: &ServerParams,
        session_id: &str,
        ctx: &TemplateContext,
    ) -> Arc<OutboundConnection> {
        let rendered = ctx.render_params(template);
        let key = Self::connection_key(&rendered);

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&key) {
            entry.sessions.insert(session_id.to_string());
            entry.idle_since = None;
            debug!(key = %key, sessions = entry.sessions.len(), "reusing template connection");
            return entry.conn.clone();
        }

        info!(key = %key, template = %template.name, "creating template connection");
        let conn = Arc::new(OutboundConnection::new(rendered));
        crate::pool::spawn_supervisor(
            conn.clone(),
            self.events.clone(),
            self.oauth.clone(),
            self.request_timeout,
        );

        let mut sessions = HashSet::new();
        sessions.insert(session_id.to_string());
        entries.insert(
            key,
            TemplateEntry {
                conn: conn.clone(),
                sessions,
                idle_since: None,
            },
        );
        conn
    }

    /// Status of the connection a context would resolve to, without
    /// creating it.
    pub async fn status(&self, template: &ServerParams, ctx: &TemplateContext) -> UpstreamStatus {
        let key = Self::connection_key(&ctx.render_params(template));
        self.entries
            .read()
            .await
            .get(&key)
            .map(|e| e.conn.status())
            .unwrap_or_default()
    }

    /// Release every rendering referenced by a closing session. Entries
    /// left without sessions start their idle clock.
    pub async fn release_session(&self, session_id: &str) {
        let mut entries = self.entries.write().await;
        for (key, entry) in entries.iter_mut() {
            if entry.sessions.remove(session_id) && entry.sessions.is_empty() {
                entry.idle_since = Some(Instant::now());
                debug!(key = %key, "template connection now idle");
            }
        }
    }

    /// Collect connections idle past the grace period. Returns the number
    /// torn down.
    pub async fn sweep_idle(&self) -> usize {
        let expired: Vec<(String, Arc<OutboundConnection>)> = {
            let mut entries = self.entries.write().await;
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| {
                    e.sessions.is_empty()
                        && e.idle_since
                            .is_some_and(|idle| idle.elapsed() >= self.idle_grace)
                })
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e.conn)))
                .collect()
        };

        let count = expired.len();
        for (key, conn) in expired {
            info!(key = %key, "collecting idle template connection");
            conn.cancel();
            if let Some(handle) = conn.take_supervisor() {
                let _ = tokio::time::timeout(SHUTDOWN_DRAIN, handle).await;
            }
        }
        count
    }

    /// Spawn the periodic GC task.
    pub fn start_gc(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let removed = self.sweep_idle().await;
                if removed > 0 {
                    debug!(removed = removed, "template GC sweep");
                }
            }
        })
    }

    /// Tear everything down.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<OutboundConnection>> = {
            let mut entries = self.entries.write().await;
            entries.drain().map(|(_, e)| e.conn).collect()
        };
        for conn in drained {
            conn.cancel();
            if let Some(handle) = conn.take_supervisor() {
                let _ = tokio::time::timeout(SHUTDOWN_DRAIN, handle).await;
            }
        }
    }

    #[cfg(test)]
    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    use onemcp_core::{EventBus, TransportKind};

    fn template_params() -> ServerParams {
        ServerParams {
            name: "t".into(),
            kind: TransportKind::Stdio,
            command: Some("/nonexistent/run".into()),
            args: vec!["--project".into(), "{{project.path}}".into()],
            env: BTreeMap::new(),
            cwd: None,
            url: None,
            headers: BTreeMap::new(),
            tags: BTreeSet::new(),
            disabled: false,
            oauth: None,
            template: true,
        }
    }

    fn ctx(path: &str) -> TemplateContext {
        TemplateContext::new(json!({"project": {"path": path}}))
    }

    #[test]
    fn key_depends_on_rendering() {
        let template = template_params();
        let a = TemplateServerManager::connection_key(&ctx("/p1").render_params(&template));
        let b = TemplateServerManager::connection_key(&ctx("/p1").render_params(&template));
        let c = TemplateServerManager::connection_key(&ctx("/p2").render_params(&template));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("t:"));
    }

    #[tokio::test]
    async fn identical_renderings_share_a_connection() {
        let bus = EventBus::new();
        let manager = TemplateServerManager::new(bus.sender());
        let template = template_params();

        let conn1 = manager.acquire(&template, "session-1", &ctx("/p1")).await;
        let conn2 = manager.acquire(&template, "session-2", &ctx("/p1")).await;
        let conn3 = manager.acquire(&template, "session-3", &ctx("/p2")).await;

        assert!(Arc::ptr_eq(&conn1, &conn2));
        assert!(!Arc::ptr_eq(&conn1, &conn3));
        assert_eq!(manager.entry_count().await, 2);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn idle_entries_survive_grace_then_collect() {
        let bus = EventBus::new();
        let manager = TemplateServerManager::new(bus.sender())
            .with_idle_grace(Duration::from_millis(50));
        let template = template_params();

        manager.acquire(&template, "session-1", &ctx("/p1")).await;
        manager.release_session("session-1").await;

        // Still inside the grace period.
        assert_eq!(manager.sweep_idle().await, 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(manager.sweep_idle().await, 1);
        assert_eq!(manager.entry_count().await, 0);
    }

    #[tokio::test]
    async fn reacquire_cancels_idle_clock() {
        let bus = EventBus::new();
        let manager = TemplateServerManager::new(bus.sender())
            .with_idle_grace(Duration::from_millis(50));
        let template = template_params();

        let first = manager.acquire(&template, "session-1", &ctx("/p1")).await;
        manager.release_session("session-1").await;
        let second = manager.acquire(&template, "session-2", &ctx("/p1")).await;
        assert!(Arc::ptr_eq(&first, &second));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(manager.sweep_idle().await, 0);

        manager.shutdown().await;
    }
}
