//! Runtime state for one outbound connection.
//!
//! The supervisor task owns all state transitions (single writer); readers
//! observe an immutable snapshot behind a short read lock. The invariant
//! `status == Connected ⇒ client is handshake-complete` holds because the
//! client handle and the status are stored under the same write.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use onemcp_core::{ServerParams, UpstreamStatus};

use crate::pool::client::OutboundClient;

/// Immutable view of a connection's status.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub status: UpstreamStatus,
    pub last_error: Option<String>,
    pub last_connected_at: Option<Instant>,
    pub attempts: u32,
}

/// Mutable runtime state for one upstream.
pub struct OutboundConnection {
    pub params: ServerParams,
    state: RwLock<StatusSnapshot>,
    client: RwLock<Option<Arc<OutboundClient>>>,
    cancel: CancellationToken,
    restart: tokio::sync::Notify,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl OutboundConnection {
    pub fn new(params: ServerParams) -> Self {
        Self {
            params,
            state: RwLock::new(StatusSnapshot::default()),
            client: RwLock::new(None),
            cancel: CancellationToken::new(),
            restart: tokio::sync::Notify::new(),
            supervisor: parking_lot::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn status(&self) -> UpstreamStatus {
        self.state.read().status
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.state.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().status == UpstreamStatus::Connected
    }

    /// The live client, if the connection is established.
    pub fn client(&self) -> Option<Arc<OutboundClient>> {
        self.client.read().clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_supervisor(&self, handle: JoinHandle<()>) {
        *self.supervisor.lock() = Some(handle);
    }

    pub fn take_supervisor(&self) -> Option<JoinHandle<()>> {
        self.supervisor.lock().take()
    }

    /// Request shutdown; the supervisor notices and drains.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Ask the supervisor to tear the transport down and dial again,
    /// picking up refreshed credentials. Used by the 401 retry hook.
    pub fn request_restart(&self) {
        self.restart.notify_waiters();
    }

    /// Resolves when a restart has been requested.
    pub async fn restart_requested(&self) {
        self.restart.notified().await;
    }

    // ---- transitions (supervisor only) ------------------------------------

    pub fn mark_connecting(&self) {
        let mut state = self.state.write();
        state.status = UpstreamStatus::Connecting;
        state.attempts = state.attempts.saturating_add(1);
    }

    pub fn mark_connected(&self, client: Arc<OutboundClient>) {
        // Client first, then status, under the same lock scope observed by
        // readers via `client()` + `status()` snapshots.
        *self.client.write() = Some(client);
        let mut state = self.state.write();
        state.status = UpstreamStatus::Connected;
        state.last_error = None;
        state.last_connected_at = Some(Instant::now());
        state.attempts = 0;
    }

    pub fn mark_error(&self, error: String) {
        self.drop_client();
        let mut state = self.state.write();
        state.status = UpstreamStatus::Error;
        state.last_error = Some(error);
    }

    pub fn mark_awaiting_oauth(&self, reason: String) {
        self.drop_client();
        let mut state = self.state.write();
        state.status = UpstreamStatus::AwaitingOauth;
        state.last_error = Some(reason);
    }

    pub fn mark_disconnected(&self) {
        self.drop_client();
        let mut state = self.state.write();
        state.status = UpstreamStatus::Disconnected;
    }

    fn drop_client(&self) {
        if let Some(client) = self.client.write().take() {
            client.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    use onemcp_core::TransportKind;

    fn params() -> ServerParams {
        ServerParams {
            name: "a".into(),
            kind: TransportKind::Stdio,
            command: Some("echo".into()),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
            url: None,
            headers: BTreeMap::new(),
            tags: BTreeSet::new(),
            disabled: false,
            oauth: None,
            template: false,
        }
    }

    #[test]
    fn status_transitions() {
        let conn = OutboundConnection::new(params());
        assert_eq!(conn.status(), UpstreamStatus::Disconnected);

        conn.mark_connecting();
        assert_eq!(conn.status(), UpstreamStatus::Connecting);
        assert_eq!(conn.snapshot().attempts, 1);

        conn.mark_error("boom".into());
        assert_eq!(conn.status(), UpstreamStatus::Error);
        assert_eq!(conn.snapshot().last_error.as_deref(), Some("boom"));
        assert!(conn.client().is_none());

        conn.mark_disconnected();
        assert_eq!(conn.status(), UpstreamStatus::Disconnected);
    }
}
