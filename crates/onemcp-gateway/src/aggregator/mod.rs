//! Capability aggregation: the per-session view over admitted upstreams.
//!
//! List requests fan out concurrently to every upstream the session's tag
//! filter admits, rename identifiers into the gateway namespace, and merge
//! the results in `(upstream, original)` order. Targeted invocations split
//! the qualified identifier and forward to exactly one upstream, returning
//! its response unchanged.

pub mod pagination;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, CompleteRequestParams, CompleteResult, GetPromptResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, Prompt,
    ReadResourceResult, Resource, ResourceTemplate, SetLevelRequestParams, Tool,
};
use rmcp::ErrorData;
use tracing::{debug, warn};

use crate::error::{redact, GatewayError};
use crate::naming::{qualify, split_qualified};
use crate::pool::{OutboundClient, OutboundConnection, UpstreamCallError};
use crate::registry::{ServerAdapter, ServerRegistry};
use crate::session::InboundSession;

use pagination::paginate;

/// How long an invocation waits for a recycled connection to come back
/// before giving up on the retry.
const RECONNECT_WAIT: Duration = Duration::from_secs(10);

/// Builds the aggregated view and routes requests for inbound sessions.
pub struct Aggregator {
    registry: Arc<ServerRegistry>,
}

impl Aggregator {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    // ---- candidate resolution ---------------------------------------------

    /// Admitted upstreams for this session: enabled and matching the tag
    /// filter, with their connections resolved (rendering templates as
    /// needed).
    async fn admitted(
        &self,
        session: &InboundSession,
    ) -> Vec<(String, Arc<OutboundConnection>)> {
        let mut out = Vec::new();
        for adapter in self.registry.adapters() {
            let params = adapter.params();
            if params.disabled || !session.filter.matches(&params.tags) {
                continue;
            }
            if let Some(conn) = self
                .registry
                .resolve(&adapter, &session.id, &session.template_ctx)
                .await
            {
                out.push((params.name.clone(), conn));
            }
        }
        out
    }

    /// The connected subset of the admitted upstreams, with live clients.
    /// Entries whose status is anything but `Connected` at this instant are
    /// excluded from aggregation.
    async fn connected(
        &self,
        session: &InboundSession,
    ) -> Result<Vec<(String, Arc<OutboundClient>)>, GatewayError> {
        let admitted = self.admitted(session).await;
        if admitted.is_empty() {
            return Ok(Vec::new());
        }
        let connected: Vec<(String, Arc<OutboundClient>)> = admitted
            .iter()
            .filter(|(_, conn)| conn.is_connected())
            .filter_map(|(name, conn)| conn.client().map(|client| (name.clone(), client)))
            .collect();
        if connected.is_empty() {
            return Err(GatewayError::UpstreamUnavailable {
                name: "any".into(),
                reason: "no connected upstream matches the session filter".into(),
            });
        }
        Ok(connected)
    }

    // ---- list surface -----------------------------------------------------

    pub async fn list_tools(
        &self,
        session: &InboundSession,
        cursor: Option<String>,
    ) -> Result<ListToolsResult, ErrorData> {
        let groups = self
            .fan_out(session, |client| async move { client.list_tools().await })
            .await?;

        let mut entries: Vec<(String, String, Tool)> = Vec::new();
        for (upstream, tools) in groups {
            for mut tool in tools {
                let original = tool.name.to_string();
                tool.name = qualify(&upstream, &original).into();
                entries.push((upstream.clone(), original, tool));
            }
        }
        let entries = sort_and_check(entries, "tool");

        let (items, next_cursor) = self.page(session, entries, cursor)?;
        Ok(ListToolsResult {
            tools: items,
            next_cursor: next_cursor.map(Into::into),
            ..Default::default()
        })
    }

    pub async fn list_prompts(
        &self,
        session: &InboundSession,
        cursor: Option<String>,
    ) -> Result<ListPromptsResult, ErrorData> {
        let groups = self
            .fan_out(session, |client| async move { client.list_prompts().await })
            .await?;

        let mut entries: Vec<(String, String, Prompt)> = Vec::new();
        for (upstream, prompts) in groups {
            for mut prompt in prompts {
                let original = prompt.name.to_string();
                prompt.name = qualify(&upstream, &original);
                entries.push((upstream.clone(), original, prompt));
            }
        }
        let entries = sort_and_check(entries, "prompt");

        let (items, next_cursor) = self.page(session, entries, cursor)?;
        Ok(ListPromptsResult {
            prompts: items,
            next_cursor: next_cursor.map(Into::into),
            ..Default::default()
        })
    }

    pub async fn list_resources(
        &self,
        session: &InboundSession,
        cursor: Option<String>,
    ) -> Result<ListResourcesResult, ErrorData> {
        let groups = self
            .fan_out(session, |client| async move { client.list_resources().await })
            .await?;

        let mut entries: Vec<(String, String, Resource)> = Vec::new();
        for (upstream, resources) in groups {
            for mut resource in resources {
                // A resource's identifier is its URI; that is what gets
                // namespaced. Invocation results are never rewritten back.
                let original = resource.raw.uri.clone();
                resource.raw.uri = qualify(&upstream, &original);
                entries.push((upstream.clone(), original, resource));
            }
        }
        let entries = sort_and_check(entries, "resource");

        let (items, next_cursor) = self.page(session, entries, cursor)?;
        Ok(ListResourcesResult {
            resources: items,
            next_cursor: next_cursor.map(Into::into),
            ..Default::default()
        })
    }

    pub async fn list_resource_templates(
        &self,
        session: &InboundSession,
        cursor: Option<String>,
    ) -> Result<ListResourceTemplatesResult, ErrorData> {
        let groups = self
            .fan_out(session, |client| async move {
                client.list_resource_templates().await
            })
            .await?;

        let mut entries: Vec<(String, String, ResourceTemplate)> = Vec::new();
        for (upstream, templates) in groups {
            for mut template in templates {
                let original = template.raw.name.clone();
                template.raw.name = qualify(&upstream, &original);
                entries.push((upstream.clone(), original, template));
            }
        }
        let entries = sort_and_check(entries, "resource template");

        let (items, next_cursor) = self.page(session, entries, cursor)?;
        Ok(ListResourceTemplatesResult {
            resource_templates: items,
            next_cursor: next_cursor.map(Into::into),
            ..Default::default()
        })
    }

    /// Concurrent fan-out of one list call across the connected admitted
    /// upstreams. Per-upstream failures are logged and omitted; the request
    /// only fails when every upstream failed.
    async fn fan_out<T, F, Fut>(
        &self,
        session: &InboundSession,
        fetch: F,
    ) -> Result<Vec<(String, Vec<T>)>, ErrorData>
    where
        F: Fn(Arc<OutboundClient>) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<T>, GatewayError>>,
    {
        let connected = match self.connected(session).await {
            Ok(connected) => connected,
            Err(e) => return Err(e.into_error_data()),
        };
        if connected.is_empty() {
            return Ok(Vec::new());
        }

        let total = connected.len();
        let fetch = &fetch;
        let results = join_all(
            connected
                .into_iter()
                .map(|(name, client)| async move { (name, fetch(client).await) }),
        )
        .await;

        let mut groups = Vec::new();
        let mut failed = 0usize;
        for (name, result) in results {
            match result {
                Ok(items) => groups.push((name, items)),
                Err(e) => {
                    failed += 1;
                    warn!(
                        upstream = %name,
                        error = %redact(&e.to_string()),
                        "fan-out call failed; omitting upstream from aggregation"
                    );
                }
            }
        }

        if failed == total {
            return Err(
                GatewayError::Internal("every admitted upstream failed the request".into())
                    .into_error_data(),
            );
        }
        Ok(groups)
    }

    fn page<T>(
        &self,
        session: &InboundSession,
        entries: Vec<(String, String, T)>,
        cursor: Option<String>,
    ) -> Result<(Vec<T>, Option<String>), ErrorData> {
        if session.pagination {
            let page = paginate(entries, cursor.as_deref(), session.page_size)
                .map_err(GatewayError::into_error_data)?;
            Ok((page.items, page.next_cursor))
        } else {
            Ok((entries.into_iter().map(|(_, _, item)| item).collect(), None))
        }
    }

    // ---- targeted invocations ---------------------------------------------

    /// Split a qualified identifier and verify the upstream is inside the
    /// session's filter set.
    fn route(
        &self,
        session: &InboundSession,
        qualified: &str,
    ) -> Result<(String, String), ErrorData> {
        let Some((upstream, original)) = split_qualified(qualified) else {
            return Err(GatewayError::InvalidRequest(format!(
                "identifier '{qualified}' carries no upstream prefix"
            ))
            .into_error_data());
        };
        let config = self.registry.manager().config();
        let Some(params) = config.get(upstream) else {
            return Err(GatewayError::InvalidRequest(format!(
                "unknown upstream '{upstream}'"
            ))
            .into_error_data());
        };
        if params.disabled || !session.filter.matches(&params.tags) {
            return Err(GatewayError::InvalidRequest(format!(
                "upstream '{upstream}' is not in this session's filter set"
            ))
            .into_error_data());
        }
        Ok((upstream.to_string(), original.to_string()))
    }

    /// Resolve the live connection and client for one routed upstream.
    async fn client_for(
        &self,
        session: &InboundSession,
        upstream: &str,
    ) -> Result<(Arc<OutboundConnection>, Arc<OutboundClient>), ErrorData> {
        let config = self.registry.manager().config();
        let params = config.get(upstream).ok_or_else(|| {
            GatewayError::InvalidRequest(format!("unknown upstream '{upstream}'")).into_error_data()
        })?;
        let adapter = ServerAdapter::for_params(params);
        let conn = self
            .registry
            .resolve(&adapter, &session.id, &session.template_ctx)
            .await
            .ok_or_else(|| {
                GatewayError::UpstreamUnavailable {
                    name: upstream.to_string(),
                    reason: "no connection".into(),
                }
                .into_error_data()
            })?;
        let client = conn.client().filter(|_| conn.is_connected()).ok_or_else(|| {
            GatewayError::UpstreamUnavailable {
                name: upstream.to_string(),
                reason: conn
                    .snapshot()
                    .last_error
                    .unwrap_or_else(|| "not connected".into()),
            }
            .into_error_data()
        })?;
        Ok((conn, client))
    }

    /// Recycle the transport after an upstream auth failure and wait
    /// briefly for the supervisor to re-establish it.
    async fn reconnect_after_auth_error(&self, conn: &OutboundConnection) -> bool {
        conn.request_restart();
        let start = tokio::time::Instant::now();
        while start.elapsed() < RECONNECT_WAIT {
            if conn.is_connected() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    pub async fn call_tool(
        &self,
        session: &InboundSession,
        params: CallToolRequestParams,
    ) -> Result<CallToolResult, ErrorData> {
        let (upstream, original) = self.route(session, &params.name)?;
        let (conn, client) = self.client_for(session, &upstream).await?;

        debug!(upstream = %upstream, tool = %original, "routing tool call");
        match client.call_tool(&original, params.arguments.clone()).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_auth_error() => {
                warn!(upstream = %upstream, "auth error on tool call, recycling connection");
                if self.reconnect_after_auth_error(&conn).await {
                    let (_, client) = self.client_for(session, &upstream).await?;
                    client
                        .call_tool(&original, params.arguments)
                        .await
                        .map_err(UpstreamCallError::into_error_data)
                } else {
                    Err(e.into_error_data())
                }
            }
            Err(e) => Err(e.into_error_data()),
        }
    }

    pub async fn get_prompt(
        &self,
        session: &InboundSession,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<GetPromptResult, ErrorData> {
        let (upstream, original) = self.route(session, name)?;
        let (_, client) = self.client_for(session, &upstream).await?;
        debug!(upstream = %upstream, prompt = %original, "routing prompt fetch");
        client
            .get_prompt(&original, arguments)
            .await
            .map_err(UpstreamCallError::into_error_data)
    }

    pub async fn read_resource(
        &self,
        session: &InboundSession,
        uri: &str,
    ) -> Result<ReadResourceResult, ErrorData> {
        let (upstream, original) = self.route(session, uri)?;
        let (_, client) = self.client_for(session, &upstream).await?;
        debug!(upstream = %upstream, uri = %original, "routing resource read");
        // Result URIs come back as the upstream produced them; only list
        // surfaces rewrite.
        client
            .read_resource(&original)
            .await
            .map_err(UpstreamCallError::into_error_data)
    }

    pub async fn complete(
        &self,
        session: &InboundSession,
        params: CompleteRequestParams,
    ) -> Result<CompleteResult, ErrorData> {
        // Rewrite the completion reference through its wire form so this
        // stays agnostic to the reference variant shape.
        let mut value = serde_json::to_value(&params).map_err(|e| {
            GatewayError::Internal(format!("serialize completion params: {e}")).into_error_data()
        })?;

        let qualified = value
            .pointer("/ref/name")
            .or_else(|| value.pointer("/ref/uri"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                GatewayError::InvalidRequest("completion reference has no name or uri".into())
                    .into_error_data()
            })?;

        let (upstream, original) = self.route(session, &qualified)?;

        let slot = if value.pointer("/ref/name").is_some() {
            value.pointer_mut("/ref/name")
        } else {
            value.pointer_mut("/ref/uri")
        };
        if let Some(slot) = slot {
            *slot = serde_json::Value::String(original);
        }
        let forwarded: CompleteRequestParams = serde_json::from_value(value).map_err(|e| {
            GatewayError::Internal(format!("rebuild completion params: {e}")).into_error_data()
        })?;

        let (_, client) = self.client_for(session, &upstream).await?;
        client
            .complete(forwarded)
            .await
            .map_err(UpstreamCallError::into_error_data)
    }

    /// Broadcast `logging/setLevel` to the filter set; success as long as
    /// at least one upstream accepted it.
    pub async fn set_level(
        &self,
        session: &InboundSession,
        params: SetLevelRequestParams,
    ) -> Result<(), ErrorData> {
        let connected = self
            .connected(session)
            .await
            .map_err(GatewayError::into_error_data)?;

        let results = join_all(connected.into_iter().map(|(name, client)| {
            let params = params.clone();
            async move { (name, client.set_level(params).await) }
        }))
        .await;

        let mut any_ok = false;
        for (name, result) in &results {
            if let Err(e) = result {
                debug!(upstream = %name, error = ?e, "setLevel rejected");
            } else {
                any_ok = true;
            }
        }
        if any_ok {
            Ok(())
        } else {
            Err(GatewayError::Internal("no upstream accepted the log level".into())
                .into_error_data())
        }
    }
}

/// Sort entries by `(upstream, original)` and log in-upstream duplicates,
/// which indicate a protocol error at that upstream.
fn sort_and_check<T>(mut entries: Vec<(String, String, T)>, kind: &str) -> Vec<(String, String, T)> {
    entries.sort_by(|a, b| (a.0.as_str(), a.1.as_str()).cmp(&(b.0.as_str(), b.1.as_str())));
    for window in entries.windows(2) {
        if window[0].0 == window[1].0 && window[0].1 == window[1].1 {
            warn!(
                upstream = %window[0].0,
                name = %window[0].1,
                "upstream listed a duplicate {kind}"
            );
        }
    }
    entries
}
