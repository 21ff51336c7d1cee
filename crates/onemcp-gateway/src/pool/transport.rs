//! Transport construction for outbound connections.
//!
//! Maps one `ServerParams` to a live MCP client over the configured
//! transport flavor: child process over stdio, SSE, or streamable HTTP.

use std::process::Stdio;
use std::time::Duration;

use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport};
use rmcp::ServiceExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use onemcp_core::{EventSender, ServerParams, TransportKind};

use crate::error::{is_auth_error, redact, GatewayError};
use crate::pool::client::{OutboundClient, OutboundClientHandler};

/// Result of one connection attempt.
pub enum ConnectOutcome {
    /// Handshake complete, transport open.
    Connected(OutboundClient),
    /// The upstream wants (re)authentication before it will talk to us.
    OauthRequired { reason: String },
    /// Connection failed; the supervisor backs off and retries.
    Failed(GatewayError),
}

/// Build a transport for `params`, run the MCP client handshake on it, and
/// return the connected client.
pub async fn connect_upstream(
    params: &ServerParams,
    events: EventSender,
    request_timeout: Duration,
    bearer: Option<String>,
) -> ConnectOutcome {
    let handler = OutboundClientHandler::new(&params.name, events);
    match params.kind {
        TransportKind::Stdio => connect_stdio(params, handler, request_timeout).await,
        TransportKind::Sse => connect_sse(params, handler, request_timeout, bearer).await,
        TransportKind::Http => connect_http(params, handler, request_timeout, bearer).await,
    }
}

async fn connect_stdio(
    params: &ServerParams,
    handler: OutboundClientHandler,
    request_timeout: Duration,
) -> ConnectOutcome {
    let Some(program) = params.command.as_deref() else {
        return ConnectOutcome::Failed(GatewayError::InvalidConfig(format!(
            "stdio upstream '{}' has no command",
            params.name
        )));
    };

    info!(
        upstream = %params.name,
        command = %program,
        args = ?params.args,
        "spawning stdio upstream"
    );

    let mut command = Command::new(program);
    command
        .args(&params.args)
        .envs(&params.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &params.cwd {
        command.current_dir(cwd);
    }
    // Keep terminal signals aimed at the gateway from reaching children.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return ConnectOutcome::Failed(GatewayError::UpstreamUnavailable {
                name: params.name.clone(),
                reason: format!("command not found: {program}. Ensure it is installed and in PATH."),
            });
        }
        Err(e) => {
            return ConnectOutcome::Failed(GatewayError::UpstreamUnavailable {
                name: params.name.clone(),
                reason: format!("failed to spawn {program}: {e}"),
            });
        }
    };

    let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
        return ConnectOutcome::Failed(GatewayError::Internal(format!(
            "child process for '{}' has no piped stdio",
            params.name
        )));
    };

    if let Some(stderr) = child.stderr.take() {
        let upstream = params.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(upstream = %upstream, "stderr: {line}");
            }
        });
    }

    match handler.serve((stdout, stdin)).await {
        Ok(service) => ConnectOutcome::Connected(OutboundClient::new(
            params.name.clone(),
            service,
            Some(child),
            request_timeout,
        )),
        Err(e) => {
            let _ = child.start_kill();
            ConnectOutcome::Failed(GatewayError::from_upstream(&params.name, e))
        }
    }
}

async fn connect_sse(
    params: &ServerParams,
    handler: OutboundClientHandler,
    request_timeout: Duration,
    bearer: Option<String>,
) -> ConnectOutcome {
    let Some(url) = params.url.clone() else {
        return ConnectOutcome::Failed(GatewayError::InvalidConfig(format!(
            "sse upstream '{}' has no url",
            params.name
        )));
    };

    let client = match build_http_client(params, bearer) {
        Ok(client) => client,
        Err(e) => return ConnectOutcome::Failed(e),
    };

    info!(upstream = %params.name, url = %url, "connecting SSE upstream");

    let transport = match SseClientTransport::start_with_client(
        client,
        SseClientConfig {
            sse_endpoint: url.into(),
            ..Default::default()
        },
    )
    .await
    {
        Ok(transport) => transport,
        Err(e) => return classify_network_error(params, e),
    };

    match handler.serve(transport).await {
        Ok(service) => ConnectOutcome::Connected(OutboundClient::new(
            params.name.clone(),
            service,
            None,
            request_timeout,
        )),
        Err(e) => classify_network_error(params, e),
    }
}

async fn connect_http(
    params: &ServerParams,
    handler: OutboundClientHandler,
    request_timeout: Duration,
    bearer: Option<String>,
) -> ConnectOutcome {
    let Some(url) = params.url.clone() else {
        return ConnectOutcome::Failed(GatewayError::InvalidConfig(format!(
            "http upstream '{}' has no url",
            params.name
        )));
    };

    let client = match build_http_client(params, bearer) {
        Ok(client) => client,
        Err(e) => return ConnectOutcome::Failed(e),
    };

    info!(upstream = %params.name, url = %url, "connecting streamable HTTP upstream");

    let transport = StreamableHttpClientTransport::with_client(
        client,
        StreamableHttpClientTransportConfig::with_uri(url),
    );

    match handler.serve(transport).await {
        Ok(service) => ConnectOutcome::Connected(OutboundClient::new(
            params.name.clone(),
            service,
            None,
            request_timeout,
        )),
        Err(e) => classify_network_error(params, e),
    }
}

/// Reqwest client carrying the configured headers, with a bearer token from
/// the refresh hook layered on top when present.
fn build_http_client(
    params: &ServerParams,
    bearer: Option<String>,
) -> Result<reqwest::Client, GatewayError> {
    let mut headers = reqwest::header::HeaderMap::new();
    for (key, value) in &params.headers {
        let name = reqwest::header::HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
            GatewayError::InvalidConfig(format!("upstream '{}': invalid header name {key}", params.name))
        })?;
        let value = reqwest::header::HeaderValue::from_str(value).map_err(|_| {
            GatewayError::InvalidConfig(format!("upstream '{}': invalid value for header {key}", params.name))
        })?;
        headers.insert(name, value);
    }
    if let Some(token) = bearer {
        let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| GatewayError::InvalidConfig("invalid bearer token".into()))?;
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .map_err(|e| GatewayError::Internal(format!("http client build failed: {e}")))
}

fn classify_network_error(params: &ServerParams, error: impl std::fmt::Display) -> ConnectOutcome {
    let text = error.to_string();
    if is_auth_error(&text) {
        warn!(upstream = %params.name, "upstream requires authorization");
        return ConnectOutcome::OauthRequired {
            reason: redact(&text),
        };
    }
    ConnectOutcome::Failed(GatewayError::from_upstream(&params.name, text))
}
