//! Inbound sessions: one filtered view per downstream transport.

mod handler;

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use rmcp::service::Peer;
use rmcp::RoleServer;
use tracing::{debug, info, warn};

use onemcp_core::{PresetStore, TagFilter, TemplateContext};

use crate::aggregator::pagination::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::error::GatewayError;
use crate::registry::ServerRegistry;

pub use handler::{GatewayHandler, HandlerContext};

/// Session metadata extracted from the connecting transport.
#[derive(Debug, Clone, Default)]
pub struct SessionParams {
    pub tags: Option<String>,
    pub tag_expression: Option<String>,
    pub preset: Option<String>,
    pub pagination: bool,
    pub page_size: Option<usize>,
    pub template_context: Option<serde_json::Value>,
}

impl SessionParams {
    /// Parse from a request query string (`tags=db,web&pagination=true`).
    pub fn from_query(query: &str) -> Self {
        let mut params = SessionParams::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "tags" => params.tags = Some(value.into_owned()),
                "tag-filter" | "tagExpression" => {
                    params.tag_expression = Some(value.into_owned())
                }
                "preset" => params.preset = Some(value.into_owned()),
                "pagination" => params.pagination = matches!(value.as_ref(), "true" | "1"),
                "pageSize" | "page-size" => params.page_size = value.parse().ok(),
                "context" => {
                    params.template_context = serde_json::from_str(value.as_ref()).ok()
                }
                _ => {}
            }
        }
        params
    }

    /// Extract from HTTP request parts: query string first, `x-1mcp-*`
    /// headers (stamped by middleware) override.
    pub fn from_parts(parts: &http::request::Parts) -> Self {
        let mut params = parts
            .uri
            .query()
            .map(Self::from_query)
            .unwrap_or_default();

        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        if let Some(tags) = header("x-1mcp-tags") {
            params.tags = Some(tags);
        }
        if let Some(expr) = header("x-1mcp-tag-filter") {
            params.tag_expression = Some(expr);
        }
        if let Some(preset) = header("x-1mcp-preset") {
            params.preset = Some(preset);
        }
        if let Some(pagination) = header("x-1mcp-pagination") {
            params.pagination = pagination == "true" || pagination == "1";
        }
        if let Some(size) = header("x-1mcp-page-size") {
            params.page_size = size.parse().ok();
        }
        if let Some(context) = header("x-1mcp-context") {
            params.template_context = serde_json::from_str(&context).ok();
        }
        params
    }
}

/// One downstream session and its derived view configuration.
pub struct InboundSession {
    pub id: String,
    pub filter: TagFilter,
    pub pagination: bool,
    pub page_size: usize,
    pub template_ctx: TemplateContext,
    pub created_at: Instant,
    peer: RwLock<Option<Peer<RoleServer>>>,
}

impl InboundSession {
    pub fn set_peer(&self, peer: Peer<RoleServer>) {
        *self.peer.write() = Some(peer);
    }

    pub fn peer(&self) -> Option<Peer<RoleServer>> {
        self.peer.read().clone()
    }
}

/// Registry of live sessions, keyed by opaque session id.
pub struct SessionManager {
    sessions: DashMap<String, Arc<InboundSession>>,
    presets: Arc<PresetStore>,
    registry: Arc<ServerRegistry>,
}

impl SessionManager {
    pub fn new(presets: Arc<PresetStore>, registry: Arc<ServerRegistry>) -> Self {
        Self {
            sessions: DashMap::new(),
            presets,
            registry,
        }
    }

    /// Create a session from transport metadata. Preset wins over an
    /// advanced expression, which wins over the simple tag list.
    pub fn attach(
        &self,
        id: String,
        params: SessionParams,
    ) -> Result<Arc<InboundSession>, GatewayError> {
        let filter = if let Some(preset) = &params.preset {
            self.presets.resolve(preset).ok_or_else(|| {
                GatewayError::InvalidRequest(format!("unknown preset '{preset}'"))
            })?
        } else if let Some(expr) = &params.tag_expression {
            TagFilter::from_expression(expr)
                .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?
        } else if let Some(tags) = &params.tags {
            TagFilter::from_tag_list(tags)
        } else {
            TagFilter::All
        };

        let session = Arc::new(InboundSession {
            id: id.clone(),
            filter,
            pagination: params.pagination,
            page_size: params
                .page_size
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .clamp(1, MAX_PAGE_SIZE),
            template_ctx: params
                .template_context
                .map(TemplateContext::new)
                .unwrap_or_default(),
            created_at: Instant::now(),
            peer: RwLock::new(None),
        });

        info!(
            session_id = %id,
            filter = ?session.filter,
            pagination = session.pagination,
            "session attached"
        );
        self.sessions.insert(id, session.clone());
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<InboundSession>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Tear a session down and release its template references. The
    /// release may trigger template-connection GC after the grace period.
    pub fn close(&self, id: &str) {
        if self.sessions.remove(id).is_none() {
            warn!(session_id = %id, "closing unknown session");
            return;
        }
        debug!(session_id = %id, "session closed");
        // The guard may drop outside the runtime during process teardown;
        // template references are moot at that point.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let registry = self.registry.clone();
            let id = id.to_string();
            handle.spawn(async move {
                registry.release_session(&id).await;
            });
        }
    }

    pub fn active(&self) -> Vec<Arc<InboundSession>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_params() {
        let params =
            SessionParams::from_query("tags=db%2Cweb&pagination=true&pageSize=50&preset=backend");
        assert_eq!(params.tags.as_deref(), Some("db,web"));
        assert!(params.pagination);
        assert_eq!(params.page_size, Some(50));
        assert_eq!(params.preset.as_deref(), Some("backend"));
    }

    #[test]
    fn parses_tag_expression() {
        let params = SessionParams::from_query("tag-filter=db+and+not+legacy");
        assert_eq!(params.tag_expression.as_deref(), Some("db and not legacy"));
    }

    #[test]
    fn empty_query_is_defaults() {
        let params = SessionParams::from_query("");
        assert!(params.tags.is_none());
        assert!(!params.pagination);
    }
}
