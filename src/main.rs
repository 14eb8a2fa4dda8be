//! Pixelboard server entry point.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use pixelboard::app;
use pixelboard::storage::{CanvasStore, PersistPolicy, StorageConfig};
use pixelboard::sync::protocol::PROTOCOL_VERSION;
use pixelboard::sync::{SyncServer, SyncServerConfig};

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pixelboard=info,tower_http=info".into()),
        )
        .init();

    dotenvy::dotenv().ok();

    let storage_path =
        std::env::var("STORAGE_PATH").unwrap_or_else(|_| "./data/pixel_data.json".to_string());
    let persist_interval_ms: u64 = env_parse("PERSIST_INTERVAL_MS", 0);
    let policy = if persist_interval_ms == 0 {
        PersistPolicy::WriteThrough
    } else {
        PersistPolicy::Debounced {
            interval: Duration::from_millis(persist_interval_ms),
        }
    };

    let config = SyncServerConfig {
        width: env_parse("GRID_WIDTH", 16_000),
        height: env_parse("GRID_HEIGHT", 16_000),
        cooldown: Duration::from_secs(env_parse("COOLDOWN_SECS", 30)),
        persist: policy,
    };

    info!(path = %storage_path, "initializing storage");
    let store = CanvasStore::new(&StorageConfig::new(&storage_path).with_policy(policy));

    let server = Arc::new(SyncServer::new(store, config));
    let background = server.clone().start_background_tasks();

    let app = app::router(server.clone());

    let port: u16 = env_parse("PORT", 8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("pixelboard server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  protocol version: {}", PROTOCOL_VERSION);
    info!("  listening on: http://{}", addr);
    info!("  websocket: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let shutdown_server = server.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_server.shutdown();
        })
        .await
        .context("server error")?;

    background.wait().await;
    server.save_if_dirty();
    Ok(())
}
