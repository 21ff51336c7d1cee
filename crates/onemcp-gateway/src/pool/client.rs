//! Outbound client: one MCP client bound to one upstream transport.
//!
//! Wraps the SDK's running client service with deadline-carrying typed
//! calls. Incoming `list_changed` notifications from the upstream are
//! forwarded onto the event bus tagged with the upstream name; server log
//! notifications land in tracing.

use std::time::Duration;

use parking_lot::Mutex;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, ClientCapabilities, ClientInfo, CompleteRequestParams,
    CompleteResult, GetPromptRequestParams, GetPromptResult, Implementation, LoggingLevel,
    LoggingMessageNotificationParam, Prompt, ReadResourceRequestParams, ReadResourceResult,
    Resource, ResourceTemplate, SetLevelRequestParams, Tool,
};
use rmcp::service::{NotificationContext, RunningService};
use rmcp::{ErrorData, RoleClient, ServiceError};
use tracing::{debug, info, warn};

use onemcp_core::{CapabilityKind, DomainEvent, EventSender};

use crate::error::GatewayError;

/// A failed targeted invocation: either a JSON-RPC error from the upstream
/// (passed through with its code intact) or a gateway-side failure.
#[derive(Debug)]
pub enum UpstreamCallError {
    Rpc(ErrorData),
    Other(GatewayError),
}

impl UpstreamCallError {
    pub fn into_error_data(self) -> ErrorData {
        match self {
            // Standard JSON-RPC codes pass through unchanged.
            UpstreamCallError::Rpc(data) => data,
            UpstreamCallError::Other(err) => err.into_error_data(),
        }
    }

    pub fn is_auth_error(&self) -> bool {
        match self {
            UpstreamCallError::Rpc(data) => crate::error::is_auth_error(&data.message),
            UpstreamCallError::Other(err) => crate::error::is_auth_error(&err.to_string()),
        }
    }
}

/// Client handler attached to every outbound connection.
#[derive(Clone)]
pub struct OutboundClientHandler {
    info: ClientInfo,
    name: String,
    events: EventSender,
}

impl OutboundClientHandler {
    pub fn new(name: &str, events: EventSender) -> Self {
        Self {
            info: ClientInfo {
                protocol_version: Default::default(),
                capabilities: ClientCapabilities::default(),
                client_info: Implementation {
                    name: format!("onemcp-{name}"),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    ..Default::default()
                },
                meta: None,
            },
            name: name.to_string(),
            events,
        }
    }

    fn forward_list_changed(&self, kind: CapabilityKind) {
        info!(upstream = %self.name, kind = ?kind, "upstream sent list_changed");
        self.events.emit(DomainEvent::ListChanged {
            name: self.name.clone(),
            kind,
        });
    }
}

impl rmcp::ClientHandler for OutboundClientHandler {
    fn get_info(&self) -> ClientInfo {
        self.info.clone()
    }

    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward_list_changed(CapabilityKind::Tools);
        std::future::ready(())
    }

    fn on_prompt_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward_list_changed(CapabilityKind::Prompts);
        std::future::ready(())
    }

    fn on_resource_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward_list_changed(CapabilityKind::Resources);
        std::future::ready(())
    }

    fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let message = match &params.data {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match params.level {
            LoggingLevel::Debug => debug!(upstream = %self.name, "{message}"),
            LoggingLevel::Warning => warn!(upstream = %self.name, "{message}"),
            LoggingLevel::Error
            | LoggingLevel::Critical
            | LoggingLevel::Alert
            | LoggingLevel::Emergency => warn!(upstream = %self.name, "{message}"),
            _ => info!(upstream = %self.name, "{message}"),
        }
        std::future::ready(())
    }
}

/// The running SDK client for one upstream.
pub type McpClientService = RunningService<RoleClient, OutboundClientHandler>;

/// One MCP client bound to one transport, with typed deadline-carrying RPC.
pub struct OutboundClient {
    name: String,
    service: McpClientService,
    /// Child process handle for stdio transports; killing it tears the
    /// transport down. Kept here so kill-on-drop does not fire early.
    child: Mutex<Option<tokio::process::Child>>,
    timeout: Duration,
}

impl OutboundClient {
    pub fn new(
        name: String,
        service: McpClientService,
        child: Option<tokio::process::Child>,
        timeout: Duration,
    ) -> Self {
        Self {
            name,
            service,
            child: Mutex::new(child),
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the transport. Idempotent; the supervisor calls this before
    /// dropping its reference.
    pub fn close(&self) {
        self.service.cancellation_token().cancel();
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.start_kill();
        }
    }

    async fn with_deadline<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Err(_) => Err(GatewayError::UpstreamTimeout {
                name: self.name.clone(),
                timeout: self.timeout,
            }),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(GatewayError::from_upstream(&self.name, e)),
        }
    }

    async fn invoke<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, UpstreamCallError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Err(_) => Err(UpstreamCallError::Other(GatewayError::UpstreamTimeout {
                name: self.name.clone(),
                timeout: self.timeout,
            })),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(ServiceError::McpError(data))) => Err(UpstreamCallError::Rpc(data)),
            Ok(Err(other)) => Err(UpstreamCallError::Other(GatewayError::from_upstream(
                &self.name, other,
            ))),
        }
    }

    // ---- list surface -----------------------------------------------------

    pub async fn list_tools(&self) -> Result<Vec<Tool>, GatewayError> {
        self.with_deadline(self.service.list_all_tools()).await
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, GatewayError> {
        self.with_deadline(self.service.list_all_prompts()).await
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, GatewayError> {
        self.with_deadline(self.service.list_all_resources()).await
    }

    pub async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>, GatewayError> {
        self.with_deadline(self.service.list_all_resource_templates())
            .await
    }

    // ---- targeted invocations ---------------------------------------------

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult, UpstreamCallError> {
        self.invoke(self.service.call_tool(CallToolRequestParams {
            name: name.to_string().into(),
            arguments,
            task: None,
            meta: None,
        }))
        .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<GetPromptResult, UpstreamCallError> {
        self.invoke(self.service.get_prompt(GetPromptRequestParams {
            name: name.to_string().into(),
            arguments,
            meta: None,
        }))
        .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, UpstreamCallError> {
        self.invoke(self.service.read_resource(ReadResourceRequestParams {
            uri: uri.to_string().into(),
            meta: None,
        }))
        .await
    }

    pub async fn complete(
        &self,
        params: CompleteRequestParams,
    ) -> Result<CompleteResult, UpstreamCallError> {
        self.invoke(self.service.complete(params)).await
    }

    pub async fn set_level(&self, params: SetLevelRequestParams) -> Result<(), UpstreamCallError> {
        self.invoke(self.service.set_level(params)).await
    }

    /// Liveness probe. The SDK has no dedicated ping request on the client
    /// surface, so a minimal `tools/list` round-trip stands in.
    pub async fn ping(&self) -> Result<(), GatewayError> {
        self.with_deadline(self.service.list_tools(Default::default()))
            .await
            .map(|_| ())
    }
}

impl Drop for OutboundClient {
    fn drop(&mut self) {
        self.close();
    }
}
