//! Routing and aggregation behavior across the session/aggregator/pool
//! boundary, without live upstream processes.

use std::collections::BTreeMap;
use std::sync::Arc;

use rmcp::model::{CallToolRequestParams, ErrorCode};

use onemcp_core::{EventBus, OutboundConfig, PresetStore, ServerParams, TransportKind};
use onemcp_gateway::aggregator::Aggregator;
use onemcp_gateway::session::{SessionManager, SessionParams};
use onemcp_gateway::{ClientManager, ServerRegistry, TemplateServerManager};

struct Harness {
    manager: Arc<ClientManager>,
    sessions: Arc<SessionManager>,
    aggregator: Aggregator,
    _config_dir: tempfile::TempDir,
}

fn stdio_server(name: &str, tags: &[&str], disabled: bool) -> ServerParams {
    ServerParams {
        name: name.into(),
        kind: TransportKind::Stdio,
        command: Some(format!("/nonexistent/{name}")),
        args: vec![],
        env: BTreeMap::new(),
        cwd: None,
        url: None,
        headers: BTreeMap::new(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        disabled,
        oauth: None,
        template: false,
    }
}

async fn harness(servers: Vec<ServerParams>) -> Harness {
    let bus = EventBus::new();
    let manager = Arc::new(ClientManager::new(bus.sender()));
    let templates = Arc::new(TemplateServerManager::new(bus.sender()));
    let registry = Arc::new(ServerRegistry::new(manager.clone(), templates));

    let config_dir = tempfile::tempdir().unwrap();
    let presets = Arc::new(PresetStore::new(config_dir.path()));
    let sessions = Arc::new(SessionManager::new(presets, registry.clone()));
    let aggregator = Aggregator::new(registry);

    let config = OutboundConfig {
        servers: servers.into_iter().map(|s| (s.name.clone(), s)).collect(),
        version: 1,
    };
    manager.apply_reload(config).await;

    Harness {
        manager,
        sessions,
        aggregator,
        _config_dir: config_dir,
    }
}

fn call_params(name: &str) -> CallToolRequestParams {
    CallToolRequestParams {
        name: name.to_string().into(),
        arguments: None,
        task: None,
        meta: None,
    }
}

#[tokio::test]
async fn unqualified_tool_name_is_invalid() {
    let h = harness(vec![stdio_server("a", &[], false)]).await;
    let session = h
        .sessions
        .attach("s1".into(), SessionParams::default())
        .unwrap();

    let err = h
        .aggregator
        .call_tool(&session, call_params("plain-name"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
    assert!(err.message.contains("prefix"));

    h.manager.shutdown().await;
}

#[tokio::test]
async fn upstream_outside_filter_set_is_invalid() {
    let h = harness(vec![
        stdio_server("a", &["db"], false),
        stdio_server("c", &["web"], false),
    ])
    .await;
    let session = h
        .sessions
        .attach(
            "s1".into(),
            SessionParams {
                tags: Some("db".into()),
                ..Default::default()
            },
        )
        .unwrap();

    // `c` exists but the session's filter does not admit it.
    let err = h
        .aggregator
        .read_resource(&session, "c_1mcp_foo")
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
    assert!(err.message.contains("filter"));

    h.manager.shutdown().await;
}

#[tokio::test]
async fn unknown_upstream_is_invalid() {
    let h = harness(vec![stdio_server("a", &[], false)]).await;
    let session = h
        .sessions
        .attach("s1".into(), SessionParams::default())
        .unwrap();

    let err = h
        .aggregator
        .call_tool(&session, call_params("ghost_1mcp_tool"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::INVALID_PARAMS);

    h.manager.shutdown().await;
}

#[tokio::test]
async fn empty_filter_set_yields_empty_lists() {
    let h = harness(vec![stdio_server("a", &["db"], false)]).await;
    let session = h
        .sessions
        .attach(
            "s1".into(),
            SessionParams {
                tags: Some("nothing-matches".into()),
                ..Default::default()
            },
        )
        .unwrap();

    let result = h.aggregator.list_tools(&session, None).await.unwrap();
    assert!(result.tools.is_empty());
    assert!(result.next_cursor.is_none());

    h.manager.shutdown().await;
}

#[tokio::test]
async fn disconnected_upstreams_fail_the_list() {
    // `a` is admitted but its command does not exist, so it can never be
    // Connected; aggregation reports unavailability rather than silence.
    let h = harness(vec![stdio_server("a", &[], false)]).await;
    let session = h
        .sessions
        .attach("s1".into(), SessionParams::default())
        .unwrap();

    let err = h.aggregator.list_tools(&session, None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::INTERNAL_ERROR);

    h.manager.shutdown().await;
}

#[tokio::test]
async fn disabled_upstreams_are_not_candidates() {
    // Only a disabled server exists: the aggregated list is empty, not an
    // error, because disabled entries are administratively off.
    let h = harness(vec![stdio_server("c", &[], true)]).await;
    let session = h
        .sessions
        .attach("s1".into(), SessionParams::default())
        .unwrap();

    let result = h.aggregator.list_tools(&session, None).await.unwrap();
    assert!(result.tools.is_empty());

    let err = h
        .aggregator
        .call_tool(&session, call_params("c_1mcp_ping"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::INVALID_PARAMS);

    h.manager.shutdown().await;
}

#[tokio::test]
async fn unknown_preset_fails_session_attach() {
    let h = harness(vec![stdio_server("a", &[], false)]).await;
    let err = h.sessions.attach(
        "s1".into(),
        SessionParams {
            preset: Some("missing".into()),
            ..Default::default()
        },
    );
    assert!(err.is_err());

    h.manager.shutdown().await;
}

#[tokio::test]
async fn sessions_observe_reload_snapshots_atomically() {
    let h = harness(vec![stdio_server("a", &[], false), stdio_server("b", &[], false)]).await;

    let before = h.manager.config();
    assert!(before.get("b").is_some());

    let next = OutboundConfig {
        servers: [stdio_server("a", &[], false), stdio_server("d", &[], false)]
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect(),
        version: 2,
    };
    let diff = h.manager.apply_reload(next).await;
    assert_eq!(diff.removed, vec!["b".to_string()]);
    assert_eq!(diff.added, vec!["d".to_string()]);

    // The old snapshot is still internally consistent for holders...
    assert!(before.get("b").is_some());
    // ...and the new one reflects the applied diff.
    let after = h.manager.config();
    assert!(after.get("b").is_none());
    assert!(after.get("d").is_some());

    h.manager.shutdown().await;
}
