use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::api::{self, AppState, SharedState};
use crate::config::GatewayConfig;
use crate::lsp::{
    ContainerPool, DockerBridgeFactory, DockerCli, PrewarmService, SessionManager, TokioSpawner,
};
use crate::ws;

/// Build the full application router with the API and the LSP WebSocket.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/lsp", get(ws::lsp_ws_handler))
        .with_state(state)
}

/// Wire the pool, session manager and prewarm service from configuration.
pub async fn build_state(config: &GatewayConfig) -> SharedState {
    let lsp = config.lsp.clone();
    let runtime = Arc::new(DockerCli::new(lsp.runtime_cmd.clone()));
    let pool = Arc::new(ContainerPool::new(lsp.clone(), runtime));
    pool.init().await;

    let factory = Arc::new(DockerBridgeFactory::new(lsp.clone()));
    let sessions = Arc::new(SessionManager::new(lsp.clone(), pool.clone(), factory));
    let prewarm = PrewarmService::new(lsp.clone(), sessions.clone(), Arc::new(TokioSpawner));

    Arc::new(AppState {
        config: lsp,
        pool,
        sessions,
        prewarm,
    })
}

/// Run the idle sweeps every `interval` until `cancel` fires.
pub async fn run_cleanup_scheduler(state: SharedState, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                state.sessions.cleanup_idle().await;
            }
        }
    }
    debug!("LSP cleanup scheduler stopped");
}

/// Close every bridge, then remove every container.
pub async fn shutdown_lsp(state: &AppState) {
    state.sessions.shutdown().await;
    state.pool.shutdown().await;
}

/// Start the gateway server.
pub async fn start_server(config: GatewayConfig) -> Result<()> {
    let state = build_state(&config).await;

    let cancel = CancellationToken::new();
    let scheduler = tokio::spawn(run_cleanup_scheduler(
        state.clone(),
        config.lsp.cleanup_interval,
        cancel.clone(),
    ));

    let mut app = build_router(state.clone());
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(
        address = %local_addr,
        lsp_enabled = config.lsp.enabled,
        runtime_available = state.pool.is_runtime_available(),
        "LSP gateway listening"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    cancel.cancel();
    let _ = scheduler.await;
    shutdown_lsp(&state).await;
    info!("Server shut down gracefully");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
