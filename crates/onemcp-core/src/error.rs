//! Configuration error types.

use std::path::PathBuf;

/// Errors produced while loading or validating the outbound configuration.
///
/// A reload that fails with any of these leaves the previously active
/// snapshot in place; only the initial load treats them as fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("duplicate server name '{0}'")]
    DuplicateName(String),

    #[error("server '{name}': {reason}")]
    InvalidServer { name: String, reason: String },

    #[error("environment variable '{0}' is not set and has no default")]
    MissingEnvVar(String),

    #[error("invalid tag expression: {0}")]
    InvalidTagExpression(String),

    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),
}
