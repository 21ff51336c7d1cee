//! Configuration loader.
//!
//! Produces immutable [`OutboundConfig`] snapshots from `mcp.json` plus any
//! `.1mcprc` project overlays. Load failures never disturb a previously
//! active snapshot; the reload service simply keeps the old one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::file::{self, ConfigFile, ServerEntry};
use crate::config::params::{OutboundConfig, ServerParams};
use crate::error::ConfigError;

/// Project overlay basename, merged over the base file when present.
pub const OVERLAY_BASENAME: &str = ".1mcprc";

/// Loads and validates outbound configuration snapshots.
pub struct ConfigLoader {
    path: PathBuf,
    version: AtomicU64,
    last_mtime: Mutex<Option<SystemTime>>,
}

impl ConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            version: AtomicU64::new(0),
            last_mtime: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load, validate and resolve the configuration into a fresh snapshot.
    pub fn load(&self) -> Result<OutboundConfig, ConfigError> {
        let base = self.read_file(&self.path)?;

        let mut entries: BTreeMap<String, (ServerEntry, bool)> = BTreeMap::new();
        collect_entries(&mut entries, base)?;

        for overlay_path in self.overlay_paths() {
            match self.read_file(&overlay_path) {
                Ok(overlay) => {
                    debug!(path = %overlay_path.display(), "applying project overlay");
                    // Overlay entries win over the base file.
                    overlay_entries(&mut entries, overlay);
                }
                Err(ConfigError::Io { .. }) => {}
                Err(e) => {
                    warn!(path = %overlay_path.display(), error = %e, "skipping malformed overlay");
                }
            }
        }

        let mut servers: BTreeMap<String, ServerParams> = BTreeMap::new();
        for (name, (entry, template)) in entries {
            let params = entry.into_params(&name, template)?;
            servers.insert(name, params);
        }

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_mtime.lock() = mtime(&self.path);

        info!(
            servers = servers.len(),
            version = version,
            path = %self.path.display(),
            "loaded outbound configuration"
        );

        Ok(OutboundConfig { servers, version })
    }

    /// Cheap change probe used to skip spurious watcher wakeups.
    pub fn mtime_changed(&self) -> bool {
        let current = mtime(&self.path);
        let last = *self.last_mtime.lock();
        match (last, current) {
            (Some(a), Some(b)) => a != b,
            (None, _) => true,
            (Some(_), None) => true,
        }
    }

    fn read_file(&self, path: &Path) -> Result<ConfigFile, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        file::parse(path, &contents)
    }

    fn overlay_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(dir) = self.path.parent() {
            paths.push(dir.join(OVERLAY_BASENAME));
        }
        if let Ok(cwd) = std::env::current_dir() {
            let candidate = cwd.join(OVERLAY_BASENAME);
            if !paths.contains(&candidate) {
                paths.push(candidate);
            }
        }
        paths
    }
}

/// Merge a parsed file into the working entry set, rejecting duplicates
/// between `mcpServers` and `mcpTemplates`.
fn collect_entries(
    entries: &mut BTreeMap<String, (ServerEntry, bool)>,
    parsed: ConfigFile,
) -> Result<(), ConfigError> {
    for (name, entry) in parsed.mcp_servers {
        if entries.contains_key(&name) {
            return Err(ConfigError::DuplicateName(name));
        }
        entries.insert(name, (entry, false));
    }
    for (name, entry) in parsed.mcp_templates {
        if entries.contains_key(&name) {
            return Err(ConfigError::DuplicateName(name));
        }
        entries.insert(name, (entry, true));
    }
    Ok(())
}

/// Overlays replace same-named base entries wholesale.
fn overlay_entries(entries: &mut BTreeMap<String, (ServerEntry, bool)>, parsed: ConfigFile) {
    for (name, entry) in parsed.mcp_servers {
        entries.insert(name, (entry, false));
    }
    for (name, entry) in parsed.mcp_templates {
        entries.insert(name, (entry, true));
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn load_increments_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "mcp.json",
            r#"{"mcpServers": {"a": {"command": "echo"}}}"#,
        );

        let loader = ConfigLoader::new(&path);
        let first = loader.load().unwrap();
        let second = loader.load().unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert!(first.get("a").is_some());
    }

    #[test]
    fn templates_are_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "mcp.json",
            r#"{
                "mcpServers": {"a": {"command": "echo"}},
                "mcpTemplates": {"t": {"command": "run", "args": ["--project", "{{project.path}}"]}}
            }"#,
        );

        let config = ConfigLoader::new(&path).load().unwrap();
        assert!(!config.get("a").unwrap().template);
        assert!(config.get("t").unwrap().template);
    }

    #[test]
    fn duplicate_across_sections_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "mcp.json",
            r#"{
                "mcpServers": {"a": {"command": "echo"}},
                "mcpTemplates": {"a": {"command": "echo"}}
            }"#,
        );

        let err = ConfigLoader::new(&path).load();
        assert!(matches!(err, Err(ConfigError::DuplicateName(name)) if name == "a"));
    }

    #[test]
    fn overlay_wins_over_base() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "mcp.json",
            r#"{"mcpServers": {"a": {"command": "base-cmd"}}}"#,
        );
        write_config(
            dir.path(),
            OVERLAY_BASENAME,
            r#"{"mcpServers": {"a": {"command": "overlay-cmd"}}}"#,
        );

        let config = ConfigLoader::new(&path).load().unwrap();
        assert_eq!(config.get("a").unwrap().command.as_deref(), Some("overlay-cmd"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "mcp.json", "{not json");
        assert!(ConfigLoader::new(&path).load().is_err());
    }

    #[test]
    fn mtime_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "mcp.json",
            r#"{"mcpServers": {"a": {"command": "echo"}}}"#,
        );
        let loader = ConfigLoader::new(&path);
        assert!(loader.mtime_changed());
        loader.load().unwrap();
        assert!(!loader.mtime_changed());
    }
}
