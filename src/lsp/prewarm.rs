//! Best-effort backend warm-up triggered by a successful login.

use std::sync::Arc;
use std::time::Instant;

use dashmap::{DashMap, DashSet};
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use super::session::SessionManager;
use crate::config::LspConfig;

/// Runs detached background work.
/// Real implementation: `TokioSpawner`. Test double: `ManualSpawner`.
pub trait TaskSpawner: Send + Sync {
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

pub struct TokioSpawner;

impl TaskSpawner for TokioSpawner {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }
}

/// Removes the workspace from the in-flight set when the warm task ends,
/// including when it is cancelled or panics.
struct InFlightGuard {
    in_flight: Arc<DashSet<String>>,
    workspace_key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.workspace_key);
    }
}

pub struct PrewarmService {
    config: LspConfig,
    sessions: Arc<SessionManager>,
    spawner: Arc<dyn TaskSpawner>,
    in_flight: Arc<DashSet<String>>,
    last_attempt: DashMap<String, Instant>,
}

impl PrewarmService {
    pub fn new(config: LspConfig, sessions: Arc<SessionManager>, spawner: Arc<dyn TaskSpawner>) -> Self {
        Self {
            config,
            sessions,
            spawner,
            in_flight: Arc::new(DashSet::new()),
            last_attempt: DashMap::new(),
        }
    }

    /// Schedule a warm-up for the login's workspace.
    ///
    /// Returns true only when a task was actually spawned.
    pub async fn schedule_login_prewarm(&self, principal: Option<&str>, session_id: Option<&str>) -> bool {
        if !self.config.enabled || !self.config.prewarm_on_login {
            debug!(reason = "disabled", "LSP prewarm skipped");
            return false;
        }

        let (Some(principal), Some(session_id)) = (non_blank(principal), non_blank(session_id)) else {
            debug!(reason = "missing_identity", "LSP prewarm skipped");
            return false;
        };
        let workspace_key = self.sessions.workspace_key_for_session(principal, session_id);

        if self.sessions.has_bridge_for_workspace_key(&workspace_key) {
            debug!(workspace_key = %workspace_key, reason = "already_warm", "LSP prewarm skipped");
            return false;
        }

        let cooldown = self.config.prewarm_cooldown;
        self.last_attempt.retain(|_, at| at.elapsed() < cooldown);
        if self.last_attempt.contains_key(&workspace_key) {
            debug!(workspace_key = %workspace_key, reason = "cooldown", "LSP prewarm skipped");
            return false;
        }

        let snapshot = self.sessions.pool().snapshot().await;
        if snapshot.is_near_ceiling(self.config.prewarm_skip_saturation_percent) {
            debug!(
                workspace_key = %workspace_key,
                reason = "saturation",
                active_sessions = snapshot.active_sessions,
                max_sessions = snapshot.max_sessions,
                "LSP prewarm skipped"
            );
            return false;
        }

        if !self.in_flight.insert(workspace_key.clone()) {
            debug!(workspace_key = %workspace_key, reason = "in_flight", "LSP prewarm skipped");
            return false;
        }
        self.last_attempt.insert(workspace_key.clone(), Instant::now());

        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            workspace_key: workspace_key.clone(),
        };
        let sessions = Arc::clone(&self.sessions);
        self.spawner.spawn(Box::pin(async move {
            let _guard = guard;
            let started = Instant::now();
            // prewarm_workspace enforces prewarm_timeout itself.
            match sessions.prewarm_workspace(&workspace_key).await {
                Ok(()) => info!(
                    workspace_key = %workspace_key,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "LSP prewarm completed"
                ),
                Err(e) if e.is_timeout() => warn!(
                    workspace_key = %workspace_key,
                    duration_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "LSP prewarm timed out"
                ),
                Err(e) => warn!(
                    workspace_key = %workspace_key,
                    error = %e,
                    "LSP prewarm failed"
                ),
            }
        }));

        true
    }

    pub fn is_in_flight(&self, workspace_key: &str) -> bool {
        self.in_flight.contains(workspace_key)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
