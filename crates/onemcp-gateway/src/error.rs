//! Gateway error vocabulary and its JSON-RPC mapping.

use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use rmcp::model::ErrorCode;
use rmcp::ErrorData;

lazy_static! {
    // Bearer tokens, api keys and anything that looks like a secret
    // assignment get scrubbed before a message is logged or returned.
    static ref BEARER: Regex = Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+").unwrap();
    static ref SECRET_ASSIGNMENT: Regex = Regex::new(
        r#"(?i)(token|secret|password|api[_-]?key|authorization)(["']?\s*[:=]\s*)(["']?)[^\s"',;&]+"#
    )
    .unwrap();
}

/// Errors surfaced by the gateway runtime.
///
/// Fan-out aggregation catches per-upstream instances of these and omits the
/// failing upstream; targeted invocations translate them 1:1 into JSON-RPC
/// errors for the downstream session.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("upstream '{name}' unavailable: {reason}")]
    UpstreamUnavailable { name: String, reason: String },

    #[error("upstream '{name}' timed out after {timeout:?}")]
    UpstreamTimeout { name: String, timeout: Duration },

    #[error("upstream '{name}' protocol error: {reason}")]
    UpstreamProtocol { name: String, reason: String },

    #[error("transport closed: {0}")]
    TransportClosed(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Map to a downstream JSON-RPC error. Request-shaped failures become
    /// invalid-params; auth failures keep their own codes; everything
    /// transport-ish is an internal error with a sanitized message.
    pub fn into_error_data(self) -> ErrorData {
        let message = redact(&self.to_string());
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::InvalidConfig(_) => {
                ErrorData::invalid_params(message, None)
            }
            GatewayError::Unauthenticated(_) => {
                ErrorData::new(ErrorCode::INVALID_REQUEST, message, None)
            }
            GatewayError::Unauthorized(_) => {
                ErrorData::new(ErrorCode::INVALID_REQUEST, message, None)
            }
            _ => ErrorData::internal_error(message, None),
        }
    }

    /// Classify a stringified upstream failure for one named upstream.
    pub fn from_upstream(name: &str, error: impl std::fmt::Display) -> GatewayError {
        let text = error.to_string();
        let lower = text.to_lowercase();
        if lower.contains("connection refused") || lower.contains("econnrefused") {
            GatewayError::ConnectionRefused(format!("{name}: {text}"))
        } else if lower.contains("transport") && lower.contains("closed") {
            GatewayError::TransportClosed(format!("{name}: {text}"))
        } else {
            GatewayError::UpstreamProtocol {
                name: name.to_string(),
                reason: text,
            }
        }
    }
}

impl From<GatewayError> for ErrorData {
    fn from(err: GatewayError) -> Self {
        err.into_error_data()
    }
}

/// Does this failure look like the upstream wants (re)authentication?
pub fn is_auth_error(error_str: &str) -> bool {
    let lower = error_str.to_lowercase();
    ["401", "unauthorized", "invalid_token", "token expired", "www-authenticate"]
        .iter()
        .any(|s| lower.contains(s))
}

/// Scrub secrets from a message before it is logged or surfaced.
pub fn redact(message: &str) -> String {
    let pass1 = BEARER.replace_all(message, "Bearer [REDACTED]");
    SECRET_ASSIGNMENT
        .replace_all(&pass1, "$1$2$3[REDACTED]")
        .into_owned()
}
