//! Server registry: uniform lookup over heterogeneous upstream kinds.
//!
//! Two upstream kinds sit behind one resolution surface: *external* servers
//! share a single process-wide connection looked up by name, *template*
//! servers are rendered against the session's context and pooled by the
//! hash of the rendering. Operations are exhaustive matches over the
//! variant, not open polymorphism.

mod template;

use std::sync::Arc;

use onemcp_core::{ServerParams, TemplateContext, UpstreamStatus};

use crate::pool::{ClientManager, OutboundConnection};

pub use template::TemplateServerManager;

/// One upstream as seen by the aggregation layer.
#[derive(Debug, Clone)]
pub enum ServerAdapter {
    /// Static upstream with a single shared connection.
    External { params: ServerParams },
    /// Parametric upstream rendered per session context.
    Template { params: ServerParams },
}

impl ServerAdapter {
    pub fn for_params(params: &ServerParams) -> Self {
        if params.template {
            ServerAdapter::Template {
                params: params.clone(),
            }
        } else {
            ServerAdapter::External {
                params: params.clone(),
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ServerAdapter::External { params } | ServerAdapter::Template { params } => &params.name,
        }
    }

    pub fn params(&self) -> &ServerParams {
        match self {
            ServerAdapter::External { params } | ServerAdapter::Template { params } => params,
        }
    }
}

/// Uniform resolution over both upstream kinds.
pub struct ServerRegistry {
    manager: Arc<ClientManager>,
    templates: Arc<TemplateServerManager>,
}

impl ServerRegistry {
    pub fn new(manager: Arc<ClientManager>, templates: Arc<TemplateServerManager>) -> Self {
        Self { manager, templates }
    }

    pub fn manager(&self) -> &Arc<ClientManager> {
        &self.manager
    }

    pub fn templates(&self) -> &Arc<TemplateServerManager> {
        &self.templates
    }

    /// Adapters for every upstream in the active config snapshot.
    pub fn adapters(&self) -> Vec<ServerAdapter> {
        self.manager
            .config()
            .servers
            .values()
            .map(ServerAdapter::for_params)
            .collect()
    }

    /// Resolve an adapter to a live connection for one session.
    ///
    /// External adapters ignore the context. Template adapters render
    /// against it and may share the resulting connection with other
    /// sessions whose renderings hash identically.
    pub async fn resolve(
        &self,
        adapter: &ServerAdapter,
        session_id: &str,
        ctx: &TemplateContext,
    ) -> Option<Arc<OutboundConnection>> {
        match adapter {
            ServerAdapter::External { params } => self.manager.get(&params.name),
            ServerAdapter::Template { params } => {
                Some(self.templates.acquire(params, session_id, ctx).await)
            }
        }
    }

    /// Status without forcing a template connection into existence.
    pub async fn status(
        &self,
        adapter: &ServerAdapter,
        ctx: &TemplateContext,
    ) -> UpstreamStatus {
        match adapter {
            ServerAdapter::External { params } => self
                .manager
                .get(&params.name)
                .map(|c| c.status())
                .unwrap_or_default(),
            ServerAdapter::Template { params } => self.templates.status(params, ctx).await,
        }
    }

    /// The key a session would share a connection under.
    pub fn connection_key(&self, adapter: &ServerAdapter, ctx: &TemplateContext) -> String {
        match adapter {
            ServerAdapter::External { params } => params.name.clone(),
            ServerAdapter::Template { params } => {
                TemplateServerManager::connection_key(&ctx.render_params(params))
            }
        }
    }

    /// Drop a closing session's template references.
    pub async fn release_session(&self, session_id: &str) {
        self.templates.release_session(session_id).await;
    }
}
