//! Named presets: operator-defined tag filters sessions can opt into.
//!
//! Presets live in `presets.json` beside the config file:
//!
//! ```json
//! { "backend": { "tags": ["db", "queue"] },
//!   "frontend": { "expression": "web and not legacy" } }
//! ```
//!
//! The store is an immutable snapshot; reloads swap the whole map.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::tags::TagFilter;

/// Preset file basename, looked up next to the config file.
pub const PRESETS_BASENAME: &str = "presets.json";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PresetEntry {
    tags: Option<Vec<String>>,
    expression: Option<String>,
}

/// Immutable name → filter mapping with atomic snapshot swap.
pub struct PresetStore {
    path: PathBuf,
    presets: RwLock<Arc<BTreeMap<String, TagFilter>>>,
}

impl PresetStore {
    /// Create a store reading `presets.json` from `config_dir`. A missing
    /// file is an empty store, not an error.
    pub fn new(config_dir: &Path) -> Self {
        let store = Self {
            path: config_dir.join(PRESETS_BASENAME),
            presets: RwLock::new(Arc::new(BTreeMap::new())),
        };
        if let Err(e) = store.reload() {
            warn!(path = %store.path.display(), error = %e, "failed to load presets");
        }
        store
    }

    /// Re-read the preset file and swap the snapshot. A malformed file
    /// leaves the previous snapshot live.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *self.presets.write() = Arc::new(BTreeMap::new());
                return Ok(());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let raw: BTreeMap<String, PresetEntry> =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })?;

        let mut presets = BTreeMap::new();
        for (name, entry) in raw {
            let filter = match (entry.tags, entry.expression) {
                (Some(tags), None) => TagFilter::AnyOf(tags),
                (None, Some(expr)) => TagFilter::from_expression(&expr)?,
                _ => {
                    return Err(ConfigError::InvalidServer {
                        name: name.clone(),
                        reason: "preset needs exactly one of 'tags' or 'expression'".into(),
                    });
                }
            };
            presets.insert(name, filter);
        }

        info!(count = presets.len(), "loaded presets");
        *self.presets.write() = Arc::new(presets);
        Ok(())
    }

    /// Resolve a preset name to its filter.
    pub fn resolve(&self, name: &str) -> Option<TagFilter> {
        self.presets.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.presets.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = PresetStore::new(dir.path());
        assert!(store.resolve("anything").is_none());
    }

    #[test]
    fn resolves_tag_and_expression_presets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PRESETS_BASENAME),
            r#"{
                "backend": {"tags": ["db", "queue"]},
                "frontend": {"expression": "web and not legacy"}
            }"#,
        )
        .unwrap();

        let store = PresetStore::new(dir.path());
        let backend = store.resolve("backend").unwrap();
        let db: BTreeSet<String> = ["db".to_string()].into_iter().collect();
        assert!(backend.matches(&db));

        let frontend = store.resolve("frontend").unwrap();
        let legacy_web: BTreeSet<String> =
            ["web".to_string(), "legacy".to_string()].into_iter().collect();
        assert!(!frontend.matches(&legacy_web));
    }

    #[test]
    fn malformed_file_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PRESETS_BASENAME);
        std::fs::write(&path, r#"{"a": {"tags": ["x"]}}"#).unwrap();

        let store = PresetStore::new(dir.path());
        assert!(store.resolve("a").is_some());

        std::fs::write(&path, "{broken").unwrap();
        assert!(store.reload().is_err());
        assert!(store.resolve("a").is_some());
    }
}
