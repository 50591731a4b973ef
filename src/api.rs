use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::LspConfig;
use crate::lsp::{ContainerPool, PrewarmService, SaturationSnapshot, SessionManager};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub config: LspConfig,
    pub pool: Arc<ContainerPool>,
    pub sessions: Arc<SessionManager>,
    pub prewarm: PrewarmService,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payload types ──────────────────────────────────

#[derive(Debug, Serialize)]
pub struct LspHealth {
    pub enabled: bool,
    pub runtime_available: bool,
    pub image_available: bool,
    pub active_containers: usize,
    pub active_bridges: usize,
    pub saturation: SaturationSnapshot,
}

impl LspHealth {
    pub fn is_healthy(&self) -> bool {
        self.enabled && self.runtime_available && self.image_available
    }
}

/// Login hook payload sent by the authentication layer.
#[derive(Debug, Deserialize)]
pub struct PrewarmRequest {
    pub principal: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PrewarmResponse {
    pub scheduled: bool,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/lsp/health", get(lsp_health))
        .route("/api/lsp/prewarm", post(schedule_prewarm))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn lsp_health(State(state): State<SharedState>) -> impl IntoResponse {
    let health = LspHealth {
        enabled: state.pool.is_enabled(),
        runtime_available: state.pool.is_runtime_available(),
        image_available: state.pool.is_image_available().await,
        active_containers: state.pool.active_session_count().await,
        active_bridges: state.sessions.active_bridge_count(),
        saturation: state.pool.snapshot().await,
    };
    let status = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

async fn schedule_prewarm(
    State(state): State<SharedState>,
    Json(req): Json<PrewarmRequest>,
) -> impl IntoResponse {
    let started = std::time::Instant::now();
    let scheduled = state
        .prewarm
        .schedule_login_prewarm(req.principal.as_deref(), req.session_id.as_deref())
        .await;
    info!(
        principal = req.principal.as_deref().unwrap_or("unknown"),
        prewarm_scheduled = scheduled,
        duration_ms = started.elapsed().as_millis() as u64,
        "Login prewarm hook"
    );
    (StatusCode::ACCEPTED, Json(PrewarmResponse { scheduled }))
}
