//! Client manager: owns the set of outbound connections.
//!
//! One supervisor task per connection handles dialing, heartbeats,
//! backoff and OAuth parking; the manager applies reload diffs and hands
//! read-only snapshots to sessions. Readers clone an `Arc` of the whole
//! map, so a reload never invalidates an iteration in progress and a
//! session created mid-reload observes either the old or the new snapshot,
//! never a half-applied one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use onemcp_core::{
    ConfigDiff, DomainEvent, EventSender, OutboundConfig, ServerParams, UpstreamStatus,
};

use crate::auth::{NoopRefresher, OauthRefresher};
use crate::error::redact;
use crate::pool::backoff::Backoff;
use crate::pool::client::OutboundClient;
use crate::pool::connection::OutboundConnection;
use crate::pool::transport::{connect_upstream, ConnectOutcome};
use crate::pool::{
    DEFAULT_REQUEST_TIMEOUT, HEARTBEAT_FAILURE_LIMIT, HEARTBEAT_INTERVAL, SHUTDOWN_DRAIN,
};

type ConnectionMap = HashMap<String, Arc<OutboundConnection>>;

/// Owns every outbound connection and applies reload diffs.
pub struct ClientManager {
    connections: RwLock<Arc<ConnectionMap>>,
    active_config: RwLock<Arc<OutboundConfig>>,
    events: EventSender,
    oauth: Arc<dyn OauthRefresher>,
    request_timeout: Duration,
    // Reloads are serialized: a new one cannot start before the previous
    // apply returns.
    reload_lock: tokio::sync::Mutex<()>,
}

impl ClientManager {
    pub fn new(events: EventSender) -> Self {
        Self {
            connections: RwLock::new(Arc::new(HashMap::new())),
            active_config: RwLock::new(Arc::new(OutboundConfig::default())),
            events,
            oauth: Arc::new(NoopRefresher),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reload_lock: tokio::sync::Mutex::new(()),
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

    /// Copy-on-write snapshot of the connection map.
    pub fn snapshot(&self) -> Arc<ConnectionMap> {
        self.connections.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<OutboundConnection>> {
        self.connections.read().get(name).cloned()
    }

    /// The config snapshot the connections currently reflect.
    pub fn config(&self) -> Arc<OutboundConfig> {
        self.active_config.read().clone()
    }

    /// Per-upstream status for the health surface.
    pub fn statuses(&self) -> BTreeMap<String, UpstreamStatus> {
        self.snapshot()
            .iter()
            .map(|(name, conn)| (name.clone(), conn.status()))
            .collect()
    }

    /// Apply a new config snapshot: shut down removed upstreams, restart
    /// mutated ones, dial added ones. A failing upstream transitions to
    /// `Error` and backs off without aborting the rest of the reload.
    pub async fn apply_reload(&self, new_config: OutboundConfig) -> ConfigDiff {
        let _guard = self.reload_lock.lock().await;

        let old_config = self.config();
        let diff = old_config.diff(&new_config);

        if diff.is_empty() {
            debug!(version = new_config.version, "reload produced no changes");
            *self.active_config.write() = Arc::new(new_config);
            return diff;
        }

        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            mutated = diff.mutated.len(),
            version = new_config.version,
            "applying configuration reload"
        );

        for name in &diff.removed {
            self.remove_connection(name).await;
        }
        for name in &diff.mutated {
            self.remove_connection(name).await;
            if let Some(params) = new_config.get(name) {
                self.spawn_connection(params.clone());
            }
        }
        for name in &diff.added {
            if let Some(params) = new_config.get(name) {
                self.spawn_connection(params.clone());
            }
        }

        *self.active_config.write() = Arc::new(new_config);
        diff
    }

    /// Insert a connection record and start its supervisor.
    fn spawn_connection(&self, params: ServerParams) {
        let name = params.name.clone();
        let conn = Arc::new(OutboundConnection::new(params));

        {
            let mut guard = self.connections.write();
            let mut next = (**guard).clone();
            next.insert(name, conn.clone());
            *guard = Arc::new(next);
        }

        spawn_supervisor(
            conn,
            self.events.clone(),
            self.oauth.clone(),
            self.request_timeout,
        );
    }

    /// Remove a connection: cancel its supervisor, wait for the drain, and
    /// drop it from the map.
    async fn remove_connection(&self, name: &str) {
        let conn = {
            let mut guard = self.connections.write();
            let mut next = (**guard).clone();
            let conn = next.remove(name);
            *guard = Arc::new(next);
            conn
        };

        let Some(conn) = conn else { return };
        conn.cancel();
        if let Some(handle) = conn.take_supervisor() {
            if tokio::time::timeout(SHUTDOWN_DRAIN, handle).await.is_err() {
                warn!(upstream = %name, "supervisor did not drain in time");
            }
        }
        debug!(upstream = %name, "connection removed");
    }

    /// Ask one connection to recycle its transport (credentials refresh).
    pub fn recycle(&self, name: &str) {
        if let Some(conn) = self.get(name) {
            conn.request_restart();
        }
    }

    /// Poll until the named upstream reports `Connected` or the deadline
    /// passes.
    pub async fn wait_connected(&self, name: &str, deadline: Duration) -> bool {
        let start = tokio::time::Instant::now();
        loop {
            match self.get(name) {
                Some(conn) if conn.is_connected() => return true,
                Some(_) => {}
                None => return false,
            }
            if start.elapsed() > deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Shut everything down with a bounded drain. Returns true when every
    /// supervisor finished inside the budget.
    pub async fn shutdown(&self) -> bool {
        let connections = {
            let mut guard = self.connections.write();
            let map = (**guard).clone();
            *guard = Arc::new(HashMap::new());
            map
        };

        info!(count = connections.len(), "shutting down outbound connections");

        let mut handles = Vec::new();
        for conn in connections.values() {
            conn.cancel();
            if let Some(handle) = conn.take_supervisor() {
                handles.push(handle);
            }
        }

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_ok()
    }
}

/// Start a supervisor task for a connection and attach its handle. Shared
/// with the template manager, whose pooled connections get the same
/// lifecycle.
pub(crate) fn spawn_supervisor(
    conn: Arc<OutboundConnection>,
    events: EventSender,
    oauth: Arc<dyn OauthRefresher>,
    request_timeout: Duration,
) {
    let handle = tokio::spawn(supervise(
        conn.clone(),
        events,
        oauth,
        request_timeout,
    ));
    conn.set_supervisor(handle);
}

/// Why an established connection stopped serving.
enum StopReason {
    Cancelled,
    RestartRequested,
    TransportLost,
}

/// Supervisor task: owns the full lifecycle of one connection.
async fn supervise(
    conn: Arc<OutboundConnection>,
    events: EventSender,
    oauth: Arc<dyn OauthRefresher>,
    request_timeout: Duration,
) {
    let name = conn.name().to_string();
    let cancel = conn.cancellation_token();

    // Disabled entries keep their record (and Disconnected status) but are
    // never dialed.
    if conn.params.disabled {
        debug!(upstream = %name, "upstream disabled, not dialing");
        cancel.cancelled().await;
        return;
    }

    let mut backoff = Backoff::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        conn.mark_connecting();
        emit_status(&events, &conn, None);

        let bearer = oauth.current_token(&conn.params).await;
        match connect_upstream(&conn.params, events.clone(), request_timeout, bearer).await {
            ConnectOutcome::Connected(client) => {
                backoff.reset();
                let client = Arc::new(client);
                conn.mark_connected(client.clone());
                emit_status(&events, &conn, None);
                info!(upstream = %name, "upstream connected");

                match run_established(&conn, &client).await {
                    StopReason::Cancelled => break,
                    StopReason::RestartRequested => {
                        info!(upstream = %name, "restart requested, reconnecting");
                        conn.mark_disconnected();
                        emit_status(&events, &conn, None);
                        continue;
                    }
                    StopReason::TransportLost => {
                        warn!(upstream = %name, "transport lost");
                        let reason = "transport closed".to_string();
                        conn.mark_error(reason.clone());
                        emit_status(&events, &conn, Some(reason));
                        if !sleep_backoff(&conn, &mut backoff).await {
                            break;
                        }
                    }
                }
            }
            ConnectOutcome::OauthRequired { reason } => {
                conn.mark_awaiting_oauth(reason.clone());
                emit_status(&events, &conn, Some(reason));

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    token = oauth.refresh(&conn.params) => {
                        match token {
                            // Token arrived: back to Connecting.
                            Some(_) => continue,
                            None => {
                                let reason = "authorization pending".to_string();
                                conn.mark_error(reason.clone());
                                emit_status(&events, &conn, Some(reason));
                                if !sleep_backoff(&conn, &mut backoff).await {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            ConnectOutcome::Failed(err) => {
                let reason = redact(&err.to_string());
                warn!(
                    upstream = %name,
                    attempt = backoff.attempt(),
                    error = %reason,
                    "connection attempt failed"
                );
                conn.mark_error(reason.clone());
                emit_status(&events, &conn, Some(reason));
                if !sleep_backoff(&conn, &mut backoff).await {
                    break;
                }
            }
        }
    }

    conn.mark_disconnected();
    emit_status(&events, &conn, None);
    debug!(upstream = %name, "supervisor stopped");
}

/// Serve until cancellation, a restart request, or heartbeat loss.
async fn run_established(conn: &OutboundConnection, client: &OutboundClient) -> StopReason {
    let cancel = conn.cancellation_token();
    let mut failures: u32 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return StopReason::Cancelled,
            _ = conn.restart_requested() => return StopReason::RestartRequested,
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                match client.ping().await {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        debug!(
                            upstream = %conn.name(),
                            failures = failures,
                            error = %e,
                            "heartbeat failed"
                        );
                        if failures >= HEARTBEAT_FAILURE_LIMIT {
                            return StopReason::TransportLost;
                        }
                    }
                }
            }
        }
    }
}

/// Backoff sleep interruptible by cancellation; false means cancelled.
async fn sleep_backoff(conn: &OutboundConnection, backoff: &mut Backoff) -> bool {
    let delay = backoff.next_delay();
    debug!(upstream = %conn.name(), delay_ms = delay.as_millis() as u64, "backing off");
    let cancel = conn.cancellation_token();
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

fn emit_status(events: &EventSender, conn: &OutboundConnection, error: Option<String>) {
    events.emit(DomainEvent::UpstreamStatusChanged {
        name: conn.name().to_string(),
        status: conn.status(),
        error,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use onemcp_core::{EventBus, TransportKind};

    fn stdio_params(name: &str, command: &str, disabled: bool) -> ServerParams {
        ServerParams {
            name: name.into(),
            kind: TransportKind::Stdio,
            command: Some(command.into()),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
            url: None,
            headers: BTreeMap::new(),
            tags: BTreeSet::new(),
            disabled,
            oauth: None,
            template: false,
        }
    }

    fn config_of(servers: Vec<ServerParams>, version: u64) -> OutboundConfig {
        OutboundConfig {
            servers: servers.into_iter().map(|s| (s.name.clone(), s)).collect(),
            version,
        }
    }

    #[tokio::test]
    async fn reload_applies_minimal_mutations() {
        let bus = EventBus::new();
        let manager = ClientManager::new(bus.sender());

        // Nonexistent commands: supervisors will sit in Error/backoff, which
        // is fine for identity checks.
        let initial = config_of(
            vec![
                stdio_params("a", "/nonexistent/a", false),
                stdio_params("b", "/nonexistent/b", false),
            ],
            1,
        );
        let diff = manager.apply_reload(initial).await;
        assert_eq!(diff.added.len(), 2);

        let a_before = manager.get("a").unwrap();

        let next = config_of(
            vec![
                stdio_params("a", "/nonexistent/a", false),
                stdio_params("d", "/nonexistent/d", false),
            ],
            2,
        );
        let diff = manager.apply_reload(next).await;
        assert_eq!(diff.added, vec!["d".to_string()]);
        assert_eq!(diff.removed, vec!["b".to_string()]);
        assert!(diff.mutated.is_empty());

        // Unchanged connections keep their identity.
        let a_after = manager.get("a").unwrap();
        assert!(Arc::ptr_eq(&a_before, &a_after));
        assert!(manager.get("b").is_none());
        assert!(manager.get("d").is_some());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn reapplying_identical_config_is_a_noop() {
        let bus = EventBus::new();
        let manager = ClientManager::new(bus.sender());

        let config = config_of(vec![stdio_params("a", "/nonexistent/a", false)], 1);
        let first = manager.apply_reload(config.clone()).await;
        assert_eq!(first.added, vec!["a".to_string()]);

        let second = manager.apply_reload(config).await;
        assert!(second.is_empty());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_upstreams_stay_disconnected() {
        let bus = EventBus::new();
        let manager = ClientManager::new(bus.sender());

        let config = config_of(vec![stdio_params("c", "/nonexistent/c", true)], 1);
        manager.apply_reload(config).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let conn = manager.get("c").unwrap();
        assert_eq!(conn.status(), UpstreamStatus::Disconnected);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn failing_upstream_transitions_to_error_with_backoff() {
        let bus = EventBus::new();
        let manager = ClientManager::new(bus.sender());

        let config = config_of(vec![stdio_params("a", "/nonexistent/a", false)], 1);
        manager.apply_reload(config).await;

        // The first dial fails immediately; give the supervisor a moment.
        let mut saw_error = false;
        for _ in 0..50 {
            if manager.get("a").unwrap().status() == UpstreamStatus::Error {
                saw_error = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(saw_error, "upstream never reached Error");
        assert!(manager.get("a").unwrap().snapshot().last_error.is_some());

        manager.shutdown().await;
    }
}
