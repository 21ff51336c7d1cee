//! Authorization: bearer validation, scope mapping, outbound token refresh.
//!
//! The gateway consumes a [`ServerAuthProvider`] for inbound sessions; the
//! default provider is the file-backed token store. When no provider is
//! configured the gateway runs open (dev mode) and skips enforcement.

pub mod store;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::middleware::Next;
use axum::response::IntoResponse;
use tracing::{debug, warn};

use onemcp_core::{ServerParams, TagFilter};

use crate::error::GatewayError;

pub use store::TokenStore;

/// Claims attached to a validated inbound bearer token.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject: String,
    pub scopes: BTreeSet<String>,
    pub expires_at: SystemTime,
}

impl AuthContext {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }
}

/// Validates inbound bearer tokens.
#[async_trait]
pub trait ServerAuthProvider: Send + Sync {
    async fn validate_bearer(&self, token: &str) -> Result<AuthContext, GatewayError>;
}

/// Supplies and refreshes bearer tokens for outbound upstream auth.
#[async_trait]
pub trait OauthRefresher: Send + Sync {
    /// Token to attach to outbound requests right now, if any.
    async fn current_token(&self, params: &ServerParams) -> Option<String>;

    /// Called after an upstream auth failure. Resolves with a fresh token
    /// once one arrives, or `None` when the flow cannot complete; the
    /// connection then parks in `AwaitingOauth`.
    async fn refresh(&self, params: &ServerParams) -> Option<String>;
}

/// Refresher for upstreams without delegated auth.
pub struct NoopRefresher;

#[async_trait]
impl OauthRefresher for NoopRefresher {
    async fn current_token(&self, _params: &ServerParams) -> Option<String> {
        None
    }

    async fn refresh(&self, _params: &ServerParams) -> Option<String> {
        None
    }
}

/// Scope required for a method family, if any.
pub fn required_scope(method: &str) -> Option<&'static str> {
    if method.starts_with("tools/") {
        Some("mcp:tools")
    } else if method.starts_with("resources/") {
        Some("mcp:resources")
    } else if method.starts_with("prompts/") {
        Some("mcp:prompts")
    } else {
        None
    }
}

/// Enforce the scope policy for one request: the method-family scope plus a
/// `tag:<name>` scope for every tag the session filter resolves.
pub fn authorize(
    ctx: &AuthContext,
    method: &str,
    filter: &TagFilter,
) -> Result<(), GatewayError> {
    if let Some(scope) = required_scope(method) {
        if !ctx.has_scope(scope) {
            return Err(GatewayError::Unauthorized(format!(
                "method '{method}' requires scope '{scope}'"
            )));
        }
    }
    for tag in filter.referenced_tags() {
        let scope = format!("tag:{tag}");
        if !ctx.has_scope(&scope) {
            return Err(GatewayError::Unauthorized(format!(
                "session filter requires scope '{scope}'"
            )));
        }
    }
    Ok(())
}

/// Header the middleware stamps with the validated subject.
pub const SUBJECT_HEADER: &str = "x-1mcp-subject";
/// Header the middleware stamps with the validated scopes (space-joined).
pub const SCOPES_HEADER: &str = "x-1mcp-scopes";

/// Axum middleware validating `Authorization: Bearer` against the
/// configured provider and stamping the claims into headers the MCP
/// handler can read back from request extensions.
pub async fn bearer_middleware(
    axum::extract::State(provider): axum::extract::State<Arc<dyn ServerAuthProvider>>,
    mut request: Request<Body>,
    next: Next,
) -> Response<Body> {
    if request.method() == axum::http::Method::OPTIONS {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        warn!("missing bearer token");
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };

    let ctx = match provider.validate_bearer(token).await {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!(error = %e, "bearer validation failed");
            return (StatusCode::UNAUTHORIZED, "invalid bearer token").into_response();
        }
    };

    debug!(subject = %ctx.subject, "authenticated session request");

    let scopes = ctx.scopes.iter().cloned().collect::<Vec<_>>().join(" ");
    if let Ok(value) = ctx.subject.parse() {
        request.headers_mut().insert(SUBJECT_HEADER, value);
    }
    if let Ok(value) = scopes.parse() {
        request.headers_mut().insert(SCOPES_HEADER, value);
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(scopes: &[&str]) -> AuthContext {
        AuthContext {
            subject: "client-1".into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            expires_at: SystemTime::now() + std::time::Duration::from_secs(60),
        }
    }

    #[test]
    fn method_families_map_to_scopes() {
        assert_eq!(required_scope("tools/list"), Some("mcp:tools"));
        assert_eq!(required_scope("tools/call"), Some("mcp:tools"));
        assert_eq!(required_scope("resources/read"), Some("mcp:resources"));
        assert_eq!(required_scope("prompts/get"), Some("mcp:prompts"));
        assert_eq!(required_scope("ping"), None);
    }

    #[test]
    fn missing_method_scope_is_unauthorized() {
        let err = authorize(&ctx(&["mcp:resources"]), "tools/call", &TagFilter::All);
        assert!(matches!(err, Err(GatewayError::Unauthorized(_))));
        assert!(authorize(&ctx(&["mcp:tools"]), "tools/call", &TagFilter::All).is_ok());
    }

    #[test]
    fn tag_scopes_are_required_for_filtered_sessions() {
        let filter = TagFilter::from_tag_list("db,web");
        let err = authorize(&ctx(&["mcp:tools", "tag:db"]), "tools/list", &filter);
        assert!(matches!(err, Err(GatewayError::Unauthorized(_))));

        let ok = authorize(
            &ctx(&["mcp:tools", "tag:db", "tag:web"]),
            "tools/list",
            &filter,
        );
        assert!(ok.is_ok());
    }
}
