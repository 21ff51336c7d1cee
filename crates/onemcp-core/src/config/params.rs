//! Immutable outbound server parameters and config snapshots.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

/// Transport flavor of an upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Sse,
    Http,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::Http => "http",
        }
    }
}

/// OAuth client descriptor for an upstream that requires delegated auth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OauthParams {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scopes: Vec<String>,
}

/// One upstream server, fully resolved.
///
/// Equality is structural: any field change between two snapshots forces a
/// restart of the connection during reload. `BTreeMap`/`BTreeSet` keep the
/// serialized form canonical so rendered templates hash stably.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerParams {
    pub name: String,
    pub kind: TransportKind,
    // stdio
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
    // network
    pub url: Option<String>,
    pub headers: BTreeMap<String, String>,
    // selection & lifecycle
    pub tags: BTreeSet<String>,
    pub disabled: bool,
    pub oauth: Option<OauthParams>,
    /// Rendered per-session from `{{var}}` placeholders when true.
    pub template: bool,
}

impl ServerParams {
    /// Canonical JSON used for template connection keys.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// An immutable snapshot of the full outbound configuration.
#[derive(Debug, Clone, Default)]
pub struct OutboundConfig {
    pub servers: BTreeMap<String, ServerParams>,
    /// Monotonic counter bumped by the loader on every successful load.
    pub version: u64,
}

impl OutboundConfig {
    pub fn get(&self, name: &str) -> Option<&ServerParams> {
        self.servers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.servers.keys()
    }

    /// Compute the minimal change set from `self` to `next`.
    pub fn diff(&self, next: &OutboundConfig) -> ConfigDiff {
        let mut diff = ConfigDiff::default();
        for (name, params) in &next.servers {
            match self.servers.get(name) {
                None => diff.added.push(name.clone()),
                Some(old) if old != params => diff.mutated.push(name.clone()),
                Some(_) => {}
            }
        }
        for name in self.servers.keys() {
            if !next.servers.contains_key(name) {
                diff.removed.push(name.clone());
            }
        }
        diff
    }
}

/// Result of diffing two config snapshots; consumed by the client manager
/// and the notification fanout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub mutated: Vec<String>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.mutated.is_empty()
    }

    /// All names affected by the reload, in no particular order.
    pub fn changed(&self) -> impl Iterator<Item = &String> {
        self.added
            .iter()
            .chain(self.removed.iter())
            .chain(self.mutated.iter())
    }
}
