//! Qualified names: the namespace-disjointing scheme.
//!
//! Every capability surfaced downstream is renamed
//! `upstream + SEP + original`; invocations split on the *first* separator
//! occurrence to recover the route. The separator is a process-wide constant
//! resolved once at startup and stable for the process lifetime.

use std::sync::OnceLock;

/// Default qualified-name separator.
pub const DEFAULT_SEPARATOR: &str = "_1mcp_";

static SEPARATOR: OnceLock<String> = OnceLock::new();

/// Fix the separator for the lifetime of the process. Later calls (or a
/// first call after any qualify/split) are ignored; the first resolution
/// wins.
pub fn init_separator(sep: impl Into<String>) {
    let _ = SEPARATOR.set(sep.into());
}

/// The active separator.
pub fn separator() -> &'static str {
    SEPARATOR.get_or_init(|| DEFAULT_SEPARATOR.to_string())
}

/// `upstream + SEP + original`.
pub fn qualify(upstream: &str, original: &str) -> String {
    format!("{upstream}{}{original}", separator())
}

/// Split a qualified identifier at the first separator occurrence.
/// Returns `None` when the separator is absent.
pub fn split_qualified(qualified: &str) -> Option<(&str, &str)> {
    qualified.split_once(separator())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let qualified = qualify("github", "create_issue");
        assert_eq!(qualified, "github_1mcp_create_issue");
        assert_eq!(split_qualified(&qualified), Some(("github", "create_issue")));
    }

    #[test]
    fn splits_on_first_occurrence_only() {
        // The original id may itself contain the separator.
        let qualified = qualify("a", "x_1mcp_y");
        assert_eq!(split_qualified(&qualified), Some(("a", "x_1mcp_y")));
    }

    #[test]
    fn missing_separator_fails() {
        assert_eq!(split_qualified("plain-name"), None);
    }

    #[test]
    fn uri_qualification() {
        let qualified = qualify("files", "file:///tmp/a.txt");
        assert_eq!(
            split_qualified(&qualified),
            Some(("files", "file:///tmp/a.txt"))
        );
    }
}
