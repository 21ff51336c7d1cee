//! Inbound HTTP surface.
//!
//! - `POST /mcp`: streamable HTTP transport (stateful sessions)
//! - `GET /sse` + `POST /messages`: SSE transport
//! - `GET /health`: gateway and per-upstream status
//!
//! Session metadata rides on query parameters; bearer validation (when a
//! provider is configured) is an axum middleware layered over the MCP
//! routes. `/health` stays open.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use rmcp::transport::sse_server::{SseServer, SseServerConfig};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use onemcp_core::{DomainEvent, EventSender, UpstreamStatus};

use crate::auth::{bearer_middleware, ServerAuthProvider};
use crate::pool::ClientManager;
use crate::session::{GatewayHandler, HandlerContext};

/// Keepalive for inbound SSE streams.
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Gateway HTTP settings.
#[derive(Clone)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: ([127, 0, 0, 1], 3050).into(),
        }
    }
}

/// The assembled inbound server.
pub struct GatewayServer {
    handler_ctx: Arc<HandlerContext>,
    manager: Arc<ClientManager>,
    auth: Option<Arc<dyn ServerAuthProvider>>,
    config: GatewayConfig,
}

impl GatewayServer {
    pub fn new(
        handler_ctx: Arc<HandlerContext>,
        manager: Arc<ClientManager>,
        auth: Option<Arc<dyn ServerAuthProvider>>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            handler_ctx,
            manager,
            auth,
            config,
        }
    }

    /// Bind and serve. Returns the bound address and the serve task; the
    /// task finishes once `shutdown` fires and in-flight requests drain.
    pub async fn serve(
        &self,
        shutdown: CancellationToken,
        events: EventSender,
    ) -> Result<(SocketAddr, JoinHandle<()>)> {
        let streamable_ctx = self.handler_ctx.clone();
        let streamable = StreamableHttpService::new(
            move || Ok(GatewayHandler::new(streamable_ctx.clone())),
            Arc::new(LocalSessionManager::default()),
            StreamableHttpServerConfig {
                stateful_mode: true,
                sse_keep_alive: Some(SSE_KEEP_ALIVE),
                sse_retry: Some(Duration::from_secs(3)),
                cancellation_token: shutdown.child_token(),
            },
        );

        let (sse_server, sse_router) = SseServer::new(SseServerConfig {
            bind: self.config.bind,
            sse_path: "/sse".to_string(),
            post_path: "/messages".to_string(),
            ct: shutdown.child_token(),
            sse_keep_alive: Some(SSE_KEEP_ALIVE),
        });
        let sse_ctx = self.handler_ctx.clone();
        let _sse_ct = sse_server.with_service(move || GatewayHandler::new(sse_ctx.clone()));

        let mut router = Router::new()
            .nest_service("/mcp", streamable)
            .merge(sse_router);

        if let Some(provider) = &self.auth {
            router = router.layer(axum::middleware::from_fn_with_state(
                provider.clone(),
                bearer_middleware,
            ));
        }

        // Added after the auth layer so probes stay unauthenticated.
        let manager = self.manager.clone();
        let router = router.route(
            "/health",
            get(move || {
                let manager = manager.clone();
                async move { axum::Json(health_payload(&manager)) }
            }),
        );

        let listener = tokio::net::TcpListener::bind(self.config.bind)
            .await
            .with_context(|| format!("failed to bind {}", self.config.bind))?;
        let local_addr = listener.local_addr().context("no local address")?;

        info!(addr = %local_addr, "gateway listening");
        events.emit(DomainEvent::GatewayStarted {
            addr: local_addr.to_string(),
        });

        let ct = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    ct.cancelled().await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "http server error");
            }
        });

        Ok((local_addr, task))
    }
}

/// `{"status": "ok" | "degraded", "upstreams": {name: status}}`; degraded
/// when any enabled upstream is not connected.
fn health_payload(manager: &ClientManager) -> serde_json::Value {
    let statuses = manager.statuses();
    let config = manager.config();

    let all_connected = config
        .servers
        .values()
        .filter(|params| !params.disabled)
        .all(|params| statuses.get(&params.name) == Some(&UpstreamStatus::Connected));

    let upstreams: serde_json::Map<String, serde_json::Value> = statuses
        .iter()
        .map(|(name, status)| {
            (
                name.clone(),
                serde_json::Value::String(status.as_str().to_string()),
            )
        })
        .collect();

    serde_json::json!({
        "status": if all_connected { "ok" } else { "degraded" },
        "upstreams": upstreams,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use onemcp_core::EventBus;

    #[tokio::test]
    async fn health_reports_ok_with_no_upstreams() {
        let bus = EventBus::new();
        let manager = ClientManager::new(bus.sender());
        let payload = health_payload(&manager);
        assert_eq!(payload["status"], "ok");
        assert!(payload["upstreams"].as_object().unwrap().is_empty());
    }
}
