//! Satscan control surface - Axum JSON endpoint and notifications
//!
//! Binds a [`satscan_core::ScanManager`] to a single operation-keyed
//! endpoint: `POST /api/blindscan/{op}` with a JSON argument map, returning
//! a JSON map. Terminal scan transitions are pushed to WebSocket clients on
//! `/api/ws` as `blindscan` notifications.

pub mod api;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use satscan_core::ScanManager;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    /// The injected scan manager; all session state lives behind it
    pub manager: Arc<ScanManager>,
    /// WebSocket notification broadcast channel
    pub ws_tx: tokio::sync::broadcast::Sender<String>,
    /// Server configuration
    pub config: ServerConfig,
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind address
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8922,
            bind_addr: "0.0.0.0".to_string(),
        }
    }
}

impl AppState {
    pub fn new(manager: Arc<ScanManager>, config: ServerConfig) -> Self {
        let (ws_tx, _) = tokio::sync::broadcast::channel(256);
        Self {
            manager,
            ws_tx,
            config,
        }
    }
}

/// Build the Axum router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/blindscan/{op}",
            axum::routing::post(api::dispatch).get(api::dispatch_get),
        )
        .route("/api/ws", axum::routing::get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the web server
pub async fn start_server(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.bind_addr, state.config.port);
    let app = build_router(state);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "satscan control surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
