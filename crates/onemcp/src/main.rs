//! OneMcp entry point.
//!
//! Environment-driven bootstrap: load the outbound config, bring up the
//! connection pool and the inbound HTTP surface, watch the config file for
//! live reloads, and drain everything in order on shutdown.
//!
//! Recognized environment:
//! - `ONE_MCP_CONFIG`: config file path (default `<configDir>/mcp.json`)
//! - `ONE_MCP_CONFIG_DIR`: state directory (presets, token store)
//! - `ONE_MCP_HOST` / `ONE_MCP_PORT`: bind address (default 127.0.0.1:3050)
//! - `ONE_MCP_SEPARATOR`: qualified-name separator for this process
//! - `ONE_MCP_AUTH`: `true` enables bearer validation via the token store
//! - `ONE_MCP_ENCRYPTION_KEY`: seals the token store at rest
//! - `ONE_MCP_LOG_JSONRPC_ERRORS`: verbose protocol-error logging
//!
//! Exit codes: 0 clean shutdown, 1 unrecoverable startup failure, 2
//! shutdown signal with non-clean drain.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use onemcp_core::config::watcher::DEFAULT_DEBOUNCE;
use onemcp_core::{ConfigLoader, ConfigWatcher, DomainEvent, EventBus, PresetStore};
use onemcp_gateway::aggregator::Aggregator;
use onemcp_gateway::auth::{ServerAuthProvider, TokenStore};
use onemcp_gateway::server::{GatewayConfig, GatewayServer};
use onemcp_gateway::session::{HandlerContext, SessionManager};
use onemcp_gateway::{
    naming, ClientManager, ConfigReloadService, NotificationFanout, ServerRegistry,
    TemplateServerManager,
};

fn init_tracing() {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("ONE_MCP_LOG_JSONRPC_ERRORS").is_ok() {
        filter = filter.add_directive("rmcp=debug".parse().expect("static directive"));
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ONE_MCP_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("1mcp")
}

fn config_path(config_dir: &std::path::Path) -> PathBuf {
    match std::env::var("ONE_MCP_CONFIG") {
        Ok(path) => PathBuf::from(path),
        Err(_) => config_dir.join("mcp.json"),
    }
}

fn bind_addr() -> Result<SocketAddr, String> {
    let host = std::env::var("ONE_MCP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("ONE_MCP_PORT").unwrap_or_else(|_| "3050".to_string());
    format!("{host}:{port}")
        .parse()
        .map_err(|e| format!("invalid bind address {host}:{port}: {e}"))
}

#[tokio::main]
async fn main() {
    init_tracing();
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    if let Ok(separator) = std::env::var("ONE_MCP_SEPARATOR") {
        naming::init_separator(separator);
    }

    let config_dir = config_dir();
    let config_path = config_path(&config_dir);

    let bind = match bind_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };

    // Initial load is fatal on failure; later reloads are not.
    let loader = Arc::new(ConfigLoader::new(&config_path));
    let initial_config = match loader.load() {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "invalid initial configuration");
            return 1;
        }
    };

    let bus = EventBus::new();
    let shutdown = CancellationToken::new();

    let manager = Arc::new(ClientManager::new(bus.sender()));
    let templates = Arc::new(TemplateServerManager::new(bus.sender()));
    let gc_task = templates.clone().start_gc();
    let registry = Arc::new(ServerRegistry::new(manager.clone(), templates.clone()));
    let presets = Arc::new(PresetStore::new(&config_dir));
    let sessions = Arc::new(SessionManager::new(presets.clone(), registry.clone()));
    let aggregator = Arc::new(Aggregator::new(registry.clone()));

    let auth_enabled = std::env::var("ONE_MCP_AUTH").is_ok_and(|v| v == "true" || v == "1");
    let auth_provider: Option<Arc<dyn ServerAuthProvider>> = if auth_enabled {
        let key = std::env::var("ONE_MCP_ENCRYPTION_KEY").ok();
        match TokenStore::open(&config_dir, key.as_deref()) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                error!(error = %e, "failed to open token store");
                return 1;
            }
        }
    } else {
        None
    };

    let handler_ctx = Arc::new(HandlerContext {
        aggregator,
        sessions: sessions.clone(),
        auth_enabled,
    });

    // Notification fanout consumes the bus before connections start.
    let fanout = Arc::new(NotificationFanout::new(sessions.clone(), manager.clone()));
    let fanout_task = fanout.start(bus.subscribe());

    // Dial the initial upstream set.
    let diff = manager.apply_reload(initial_config).await;
    info!(upstreams = diff.added.len(), "initial upstream set starting");

    // Live reload pipeline.
    let (watcher, reload_rx) = match ConfigWatcher::start(&config_path, DEFAULT_DEBOUNCE) {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "failed to start config watcher");
            return 1;
        }
    };
    let reload_task = ConfigReloadService::new(
        loader.clone(),
        manager.clone(),
        presets.clone(),
        bus.sender(),
    )
    .start(reload_rx);

    // Inbound surface.
    let server = GatewayServer::new(
        handler_ctx,
        manager.clone(),
        auth_provider,
        GatewayConfig { bind },
    );
    let (addr, server_task) = match server.serve(shutdown.clone(), bus.sender()).await {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "failed to start gateway");
            return 1;
        }
    };
    info!(addr = %addr, "onemcp ready");

    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to listen for shutdown signal");
    }
    info!("shutdown signal received");

    // Ordered teardown: stop accepting and close inbound transports, then
    // drain outbound connections, then stop the watcher.
    let mut clean = true;
    shutdown.cancel();
    if tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .is_err()
    {
        warn!("inbound server did not stop in time");
        clean = false;
    }

    if !manager.shutdown().await {
        warn!("outbound connections did not drain in time");
        clean = false;
    }
    templates.shutdown().await;

    watcher.stop();
    reload_task.abort();
    fanout_task.abort();
    gc_task.abort();

    bus.sender().emit(DomainEvent::GatewayStopped);
    info!(clean = clean, "shutdown complete");

    if clean {
        0
    } else {
        2
    }
}
