//! End-to-end reload pipeline: file change → watcher → loader → manager.

use std::sync::Arc;
use std::time::Duration;

use onemcp_core::{ConfigLoader, ConfigWatcher, DomainEvent, EventBus, PresetStore};
use onemcp_gateway::{ClientManager, ConfigReloadService};

fn write_config(path: &std::path::Path, servers: &[(&str, &str)]) {
    let entries: Vec<String> = servers
        .iter()
        .map(|(name, command)| format!(r#""{name}": {{"command": "{command}"}}"#))
        .collect();
    let contents = format!(r#"{{"mcpServers": {{{}}}}}"#, entries.join(","));
    std::fs::write(path, contents).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn file_edit_drives_connection_diff() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("mcp.json");
    write_config(&config_path, &[("a", "/nonexistent/a"), ("b", "/nonexistent/b")]);

    let bus = EventBus::new();
    let mut events = bus.subscribe();

    let loader = Arc::new(ConfigLoader::new(&config_path));
    let manager = Arc::new(ClientManager::new(bus.sender()));
    let presets = Arc::new(PresetStore::new(dir.path()));

    let initial = loader.load().unwrap();
    manager.apply_reload(initial).await;
    assert!(manager.get("a").is_some());
    assert!(manager.get("b").is_some());

    let (watcher, reload_rx) =
        ConfigWatcher::start(&config_path, Duration::from_millis(100)).unwrap();
    let reload_task =
        ConfigReloadService::new(loader, manager.clone(), presets, bus.sender()).start(reload_rx);

    let a_before = manager.get("a").unwrap();

    // Replace `b` with `d`.
    write_config(&config_path, &[("a", "/nonexistent/a"), ("d", "/nonexistent/d")]);

    // Wait for the reload event to surface on the bus.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut reloaded = false;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Some(DomainEvent::ConfigReloaded { diff })) => {
                assert_eq!(diff.added, vec!["d".to_string()]);
                assert_eq!(diff.removed, vec!["b".to_string()]);
                reloaded = true;
                break;
            }
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    assert!(reloaded, "no ConfigReloaded event observed");

    // Unchanged upstream kept its identity; removed one is gone.
    let a_after = manager.get("a").unwrap();
    assert!(Arc::ptr_eq(&a_before, &a_after));
    assert!(manager.get("b").is_none());
    assert!(manager.get("d").is_some());

    watcher.stop();
    reload_task.abort();
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_edit_keeps_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("mcp.json");
    write_config(&config_path, &[("a", "/nonexistent/a")]);

    let bus = EventBus::new();
    let loader = Arc::new(ConfigLoader::new(&config_path));
    let manager = Arc::new(ClientManager::new(bus.sender()));
    let presets = Arc::new(PresetStore::new(dir.path()));

    let initial = loader.load().unwrap();
    manager.apply_reload(initial).await;

    let service = ConfigReloadService::new(loader, manager.clone(), presets, bus.sender());

    std::fs::write(&config_path, "{this is not json").unwrap();
    service.reload_once().await;

    // The active snapshot still carries `a`.
    assert!(manager.get("a").is_some());
    assert!(manager.config().get("a").is_some());

    manager.shutdown().await;
}
