//! Config file watcher.
//!
//! Watches the *directory* containing the config file rather than the file
//! itself, because most editors replace files by rename and a file-level
//! watch would go stale after the first save. Raw events matching the config
//! basename (or its temp-variants) arm a debounce timer; when the timer
//! fires one reload request is delivered to the single subscriber.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ConfigError;

/// Default debounce window between a file event and the reload.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// A request to reload the configuration. Carries nothing; the subscriber
/// re-invokes the loader itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadRequest;

/// Watches a config file's directory and emits debounced reload requests.
pub struct ConfigWatcher {
    // Kept alive to continue watching.
    _watcher: RecommendedWatcher,
    debounce_task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching. Returns the watcher handle and the reload channel.
    ///
    /// The channel has capacity 1: bursts of events within one debounce
    /// window collapse to a single request, and a request raised while the
    /// subscriber is still applying the previous reload is queued, not
    /// stacked.
    pub fn start(
        config_path: impl Into<PathBuf>,
        debounce: Duration,
    ) -> Result<(Self, mpsc::Receiver<ReloadRequest>), ConfigError> {
        let config_path = config_path.into();
        let dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let basename = config_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (raw_tx, raw_rx) = mpsc::channel::<PathBuf>(100);
        let (reload_tx, reload_rx) = mpsc::channel::<ReloadRequest>(1);

        let match_name = basename.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) {
                        return;
                    }
                    for path in event.paths {
                        if path_matches(&path, &match_name) {
                            debug!(path = %path.display(), "config file event");
                            if let Err(e) = raw_tx.blocking_send(path) {
                                warn!("failed to forward file event: {e}");
                            }
                        }
                    }
                }
                Err(e) => error!("file watcher error: {e}"),
            })?;

        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(dir = %dir.display(), file = %basename, "config watcher started");

        let debounce_task = tokio::spawn(debounce_loop(raw_rx, reload_tx, debounce));

        Ok((
            Self {
                _watcher: watcher,
                debounce_task,
            },
            reload_rx,
        ))
    }

    /// Stop watching and cancel any pending debounce timer.
    pub fn stop(self) {
        self.debounce_task.abort();
    }
}

/// Collapses raw file events into at most one reload per debounce window.
async fn debounce_loop(
    mut raw_rx: mpsc::Receiver<PathBuf>,
    reload_tx: mpsc::Sender<ReloadRequest>,
    debounce: Duration,
) {
    let mut pending: Option<Instant> = None;
    let poll = Duration::from_millis(50).min(debounce);

    loop {
        tokio::select! {
            event = raw_rx.recv() => {
                match event {
                    // Any new event extends the window.
                    Some(_) => pending = Some(Instant::now()),
                    None => break,
                }
            }
            _ = tokio::time::sleep(poll) => {
                if let Some(armed_at) = pending {
                    if armed_at.elapsed() >= debounce {
                        pending = None;
                        debug!("debounce elapsed, requesting reload");
                        if reload_tx.send(ReloadRequest).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Matches the config basename and the temp-variants editors produce while
/// saving (`mcp.json.tmp`, `.mcp.json.swp`, `mcp.json~`).
fn path_matches(path: &Path, basename: &str) -> bool {
    if basename.is_empty() {
        return false;
    }
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    name == basename
        || name.strip_prefix('.').is_some_and(|n| n.starts_with(basename))
        || name.starts_with(&format!("{basename}."))
        || name.starts_with(&format!("{basename}~"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn matches_temp_variants() {
        let base = "mcp.json";
        assert!(path_matches(Path::new("/cfg/mcp.json"), base));
        assert!(path_matches(Path::new("/cfg/mcp.json.tmp"), base));
        assert!(path_matches(Path::new("/cfg/.mcp.json.swp"), base));
        assert!(path_matches(Path::new("/cfg/mcp.json~"), base));
        assert!(!path_matches(Path::new("/cfg/other.json"), base));
        assert!(!path_matches(Path::new("/cfg/mcp.jso"), base));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn emits_single_reload_for_burst_of_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, "{}").unwrap();

        let (watcher, mut reload_rx) =
            ConfigWatcher::start(&path, Duration::from_millis(100)).unwrap();

        // Burst of writes within one debounce window.
        for i in 0..5 {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "// {i}").unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let first = tokio::time::timeout(Duration::from_secs(5), reload_rx.recv())
            .await
            .expect("reload within timeout");
        assert_eq!(first, Some(ReloadRequest));

        // No second reload should be pending after the window drains.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(reload_rx.try_recv().is_err());

        watcher.stop();
    }
}
