//! The inbound MCP service: one handler instance per downstream session.
//!
//! The transport layer constructs a fresh handler per session through a
//! service factory. Session metadata travels in request extensions (the
//! HTTP layer preserves `http::request::Parts`, including the headers the
//! middleware stamped); the handler resolves its session lazily on the
//! first request and tears it down when the last clone drops.

use std::sync::Arc;
use std::time::SystemTime;

use rmcp::model::*;
use rmcp::service::{NotificationContext, RequestContext};
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::auth::{authorize, AuthContext, SCOPES_HEADER, SUBJECT_HEADER};
use crate::error::GatewayError;
use crate::session::{InboundSession, SessionManager, SessionParams};

/// Shared dependencies for every handler instance.
pub struct HandlerContext {
    pub aggregator: Arc<Aggregator>,
    pub sessions: Arc<SessionManager>,
    /// When false (no auth provider configured) scope checks are skipped.
    pub auth_enabled: bool,
}

/// Releases the session when the transport drops its service.
struct SessionGuard {
    id: String,
    sessions: Arc<SessionManager>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.close(&self.id);
    }
}

/// Per-session MCP server handler.
#[derive(Clone)]
pub struct GatewayHandler {
    ctx: Arc<HandlerContext>,
    guard: Arc<SessionGuard>,
}

impl GatewayHandler {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let guard = Arc::new(SessionGuard {
            id,
            sessions: ctx.sessions.clone(),
        });
        Self { ctx, guard }
    }

    pub fn session_id(&self) -> &str {
        &self.guard.id
    }

    /// The session for this handler, attached from transport metadata on
    /// first use.
    fn resolve_session(&self, extensions: &Extensions) -> Result<Arc<InboundSession>, McpError> {
        if let Some(session) = self.ctx.sessions.get(self.session_id()) {
            return Ok(session);
        }
        let params = extensions
            .get::<http::request::Parts>()
            .map(SessionParams::from_parts)
            .unwrap_or_default();
        self.ctx
            .sessions
            .attach(self.session_id().to_string(), params)
            .map_err(GatewayError::into_error_data)
    }

    fn authorize_request(
        &self,
        extensions: &Extensions,
        method: &str,
        session: &InboundSession,
    ) -> Result<(), McpError> {
        if !self.ctx.auth_enabled {
            return Ok(());
        }
        let Some(parts) = extensions.get::<http::request::Parts>() else {
            return Err(
                GatewayError::Unauthenticated("request carries no transport context".into())
                    .into_error_data(),
            );
        };
        let subject = parts
            .headers
            .get(SUBJECT_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                GatewayError::Unauthenticated("request was not authenticated".into())
                    .into_error_data()
            })?;
        let scopes = parts
            .headers
            .get(SCOPES_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let auth_ctx = AuthContext {
            subject: subject.to_string(),
            scopes,
            expires_at: SystemTime::now(),
        };
        authorize(&auth_ctx, method, &session.filter).map_err(GatewayError::into_error_data)
    }

    fn session_for(
        &self,
        context: &RequestContext<RoleServer>,
        method: &str,
    ) -> Result<Arc<InboundSession>, McpError> {
        let session = self.resolve_session(&context.extensions)?;
        self.authorize_request(&context.extensions, method, &session)?;
        Ok(session)
    }
}

impl ServerHandler for GatewayHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder()
                .enable_logging()
                .enable_completions()
                .enable_tools_with(ToolsCapability {
                    list_changed: Some(true),
                })
                .enable_prompts_with(PromptsCapability {
                    list_changed: Some(true),
                })
                .enable_resources_with(ResourcesCapability {
                    subscribe: Some(false),
                    list_changed: Some(true),
                })
                .build(),
            server_info: Implementation {
                name: "onemcp-gateway".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "OneMcp aggregates multiple MCP servers behind one endpoint. \
                 Capability names are prefixed with their upstream server name."
                    .to_string(),
            ),
        }
    }

    async fn on_initialized(&self, context: NotificationContext<RoleServer>) {
        match self.resolve_session(&context.extensions) {
            Ok(session) => {
                session.set_peer(context.peer.clone());
                info!(
                    session_id = %self.session_id(),
                    "client initialized, peer registered for notifications"
                );
            }
            Err(e) => {
                warn!(
                    session_id = %self.session_id(),
                    error = ?e,
                    "failed to attach session on initialize"
                );
            }
        }
    }

    async fn ping(&self, _context: RequestContext<RoleServer>) -> Result<(), McpError> {
        Ok(())
    }

    async fn list_tools(
        &self,
        params: Option<PaginatedRequestParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let session = self.session_for(&context, "tools/list")?;
        let cursor = params.and_then(|p| p.cursor).map(|c| c.to_string());
        let result = self.ctx.aggregator.list_tools(&session, cursor).await?;
        debug!(
            session_id = %self.session_id(),
            count = result.tools.len(),
            "list_tools"
        );
        Ok(result)
    }

    async fn call_tool(
        &self,
        params: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let session = self.session_for(&context, "tools/call")?;
        info!(
            session_id = %self.session_id(),
            tool = %params.name,
            "call_tool"
        );
        self.ctx.aggregator.call_tool(&session, params).await
    }

    async fn list_prompts(
        &self,
        params: Option<PaginatedRequestParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        let session = self.session_for(&context, "prompts/list")?;
        let cursor = params.and_then(|p| p.cursor).map(|c| c.to_string());
        self.ctx.aggregator.list_prompts(&session, cursor).await
    }

    async fn get_prompt(
        &self,
        params: GetPromptRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        let session = self.session_for(&context, "prompts/get")?;
        info!(
            session_id = %self.session_id(),
            prompt = %params.name,
            "get_prompt"
        );
        self.ctx
            .aggregator
            .get_prompt(&session, &params.name, params.arguments)
            .await
    }

    async fn list_resources(
        &self,
        params: Option<PaginatedRequestParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        let session = self.session_for(&context, "resources/list")?;
        let cursor = params.and_then(|p| p.cursor).map(|c| c.to_string());
        self.ctx.aggregator.list_resources(&session, cursor).await
    }

    async fn list_resource_templates(
        &self,
        params: Option<PaginatedRequestParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        let session = self.session_for(&context, "resources/templates/list")?;
        let cursor = params.and_then(|p| p.cursor).map(|c| c.to_string());
        self.ctx
            .aggregator
            .list_resource_templates(&session, cursor)
            .await
    }

    async fn read_resource(
        &self,
        params: ReadResourceRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let session = self.session_for(&context, "resources/read")?;
        info!(
            session_id = %self.session_id(),
            uri = %params.uri,
            "read_resource"
        );
        self.ctx.aggregator.read_resource(&session, &params.uri).await
    }

    async fn complete(
        &self,
        params: CompleteRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<CompleteResult, McpError> {
        let session = self.session_for(&context, "completion/complete")?;
        self.ctx.aggregator.complete(&session, params).await
    }

    async fn set_level(
        &self,
        params: SetLevelRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<(), McpError> {
        let session = self.session_for(&context, "logging/setLevel")?;
        self.ctx.aggregator.set_level(&session, params).await
    }
}
