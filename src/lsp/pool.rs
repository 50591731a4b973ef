//! Container pool: one language-server container per workspace key.
//!
//! Every public mutating method takes the single pool mutex for its whole
//! critical section, including the container CLI calls it makes, so callers
//! never observe a half-applied update. Admission control only limits growth
//! of the active set: an already-present workspace key is always reused.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::naming::{CONTAINER_PREFIX, container_name};
use super::runtime::ContainerRuntime;
use crate::config::LspConfig;

const IDLE_POOL_PREFIX: &str = "idle-pool-";

/// Read-only view of the pool's counters, produced on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SaturationSnapshot {
    pub acquire_attempts: u64,
    pub acquire_reuse_count: u64,
    pub acquire_create_count: u64,
    pub acquire_idle_pool_hit_count: u64,
    pub acquire_idle_pool_miss_count: u64,
    pub acquire_failure_count: u64,
    pub saturation_reject_count: u64,
    pub active_sessions: usize,
    pub idle_pool_size: usize,
    pub max_sessions: usize,
    pub last_saturation_epoch_ms: Option<i64>,
    pub last_saturation_workspace_key: Option<String>,
    pub idle_pool_create_count: u64,
    pub idle_pool_evict_count: u64,
}

impl SaturationSnapshot {
    /// True when active sessions reached `percent` % of the ceiling.
    pub fn is_near_ceiling(&self, percent: u32) -> bool {
        if self.max_sessions == 0 {
            return true;
        }
        self.active_sessions as u64 * 100 >= percent as u64 * self.max_sessions as u64
    }
}

struct ContainerSession {
    container_name: String,
    ref_count: u32,
    last_used: Instant,
}

struct IdleContainer {
    container_name: String,
    created: Instant,
}

#[derive(Default)]
struct PoolCounters {
    acquire_attempts: u64,
    acquire_reuse_count: u64,
    acquire_create_count: u64,
    acquire_idle_pool_hit_count: u64,
    acquire_idle_pool_miss_count: u64,
    acquire_failure_count: u64,
    saturation_reject_count: u64,
    last_saturation_epoch_ms: Option<i64>,
    last_saturation_workspace_key: Option<String>,
    idle_pool_create_count: u64,
    idle_pool_evict_count: u64,
}

#[derive(Default)]
struct PoolState {
    sessions: HashMap<String, ContainerSession>,
    idle: VecDeque<IdleContainer>,
    counters: PoolCounters,
    idle_seq: u64,
}

/// Owns the workspace-key → container mapping and all pool counters.
pub struct ContainerPool {
    config: LspConfig,
    runtime: Arc<dyn ContainerRuntime>,
    runtime_available: AtomicBool,
    state: Mutex<PoolState>,
}

impl ContainerPool {
    pub fn new(config: LspConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config,
            runtime,
            runtime_available: AtomicBool::new(false),
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Probe the container runtime and fill the idle pool.
    pub async fn init(&self) {
        if !self.config.enabled {
            self.runtime_available.store(false, Ordering::SeqCst);
            info!("LSP is disabled by configuration");
            return;
        }

        let version = self.runtime.run(&args(["version"])).await;
        let available = version.success();
        self.runtime_available.store(available, Ordering::SeqCst);
        if !available {
            warn!(
                runtime = %self.runtime.program(),
                output = %version.output,
                "Container runtime is not available. LSP container mode cannot start."
            );
            return;
        }

        let mut state = self.state.lock().await;
        self.ensure_min_idle(&mut state).await;
    }

    /// Bind a container to `workspace_key`, reusing an existing one if present.
    ///
    /// Returns `None` when the pool is disabled, saturated, or provisioning
    /// fails; a failed provisioning leaves no entry behind.
    pub async fn acquire(&self, workspace_key: &str) -> Option<String> {
        let started = Instant::now();
        let mut state = self.state.lock().await;
        state.counters.acquire_attempts += 1;

        if !self.config.enabled || !self.is_runtime_available() {
            state.counters.acquire_failure_count += 1;
            debug!(
                workspace_key,
                enabled = self.config.enabled,
                runtime_available = self.is_runtime_available(),
                "LSP acquire skipped"
            );
            return None;
        }

        if let Some(existing) = state.sessions.get_mut(workspace_key) {
            existing.ref_count += 1;
            existing.last_used = Instant::now();
            let name = existing.container_name.clone();
            let ref_count = existing.ref_count;
            state.counters.acquire_reuse_count += 1;
            debug!(
                workspace_key,
                container = %name,
                ref_count,
                duration_ms = started.elapsed().as_millis() as u64,
                "LSP acquire reused"
            );
            return Some(name);
        }

        if state.sessions.len() >= self.config.max_sessions {
            let counters = &mut state.counters;
            counters.saturation_reject_count += 1;
            counters.acquire_failure_count += 1;
            counters.last_saturation_epoch_ms = Some(chrono::Utc::now().timestamp_millis());
            counters.last_saturation_workspace_key = Some(workspace_key.to_string());
            warn!(
                workspace_key,
                active_sessions = state.sessions.len(),
                max_sessions = self.config.max_sessions,
                saturation_reject_count = state.counters.saturation_reject_count,
                acquire_attempts = state.counters.acquire_attempts,
                "LSP acquire rejected stage=saturation"
            );
            return None;
        }

        if let Some(pooled) = state.idle.pop_front() {
            let name = pooled.container_name;
            state.sessions.insert(
                workspace_key.to_string(),
                ContainerSession {
                    container_name: name.clone(),
                    ref_count: 1,
                    last_used: Instant::now(),
                },
            );
            state.counters.acquire_idle_pool_hit_count += 1;
            debug!(
                workspace_key,
                container = %name,
                active_sessions = state.sessions.len(),
                idle_pool_size = state.idle.len(),
                duration_ms = started.elapsed().as_millis() as u64,
                "LSP acquire idle-hit"
            );
            self.ensure_min_idle(&mut state).await;
            return Some(name);
        }
        state.counters.acquire_idle_pool_miss_count += 1;

        let name = container_name(workspace_key);
        if !self.create_and_start(&name).await {
            state.counters.acquire_failure_count += 1;
            warn!(
                workspace_key,
                container = %name,
                duration_ms = started.elapsed().as_millis() as u64,
                "LSP acquire failed"
            );
            return None;
        }

        state.sessions.insert(
            workspace_key.to_string(),
            ContainerSession {
                container_name: name.clone(),
                ref_count: 1,
                last_used: Instant::now(),
            },
        );
        state.counters.acquire_create_count += 1;
        debug!(
            workspace_key,
            container = %name,
            active_sessions = state.sessions.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "LSP acquire created"
        );
        Some(name)
    }

    /// Drop one reference to the workspace's container. Unknown keys are ignored.
    pub async fn release(&self, workspace_key: &str) {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(workspace_key) {
            session.ref_count = session.ref_count.saturating_sub(1);
            session.last_used = Instant::now();
        }
    }

    /// Remove the workspace's entry and container regardless of its reference count.
    pub async fn force_remove(&self, workspace_key: &str) {
        let mut state = self.state.lock().await;
        if let Some(removed) = state.sessions.remove(workspace_key) {
            debug!(workspace_key, container = %removed.container_name, "LSP container force-removed");
            self.remove_container(&removed.container_name).await;
        }
    }

    /// Evict unreferenced entries idle longer than the TTL and trim the idle pool.
    pub async fn cleanup_idle(&self) {
        self.cleanup_idle_except(&HashSet::new()).await;
    }

    /// Like `cleanup_idle`, but never evicts a key in `in_use`: workspaces
    /// whose backend process still runs inside the container.
    pub async fn cleanup_idle_except(&self, in_use: &HashSet<String>) {
        let started = Instant::now();
        let mut state = self.state.lock().await;
        let ttl = self.config.idle_ttl;
        let before = state.sessions.len();

        let expired: Vec<String> = state
            .sessions
            .iter()
            .filter(|(key, s)| {
                s.ref_count == 0 && s.last_used.elapsed() > ttl && !in_use.contains(key.as_str())
            })
            .map(|(key, _)| key.clone())
            .collect();

        for workspace_key in &expired {
            if let Some(removed) = state.sessions.remove(workspace_key) {
                debug!(
                    workspace_key = %workspace_key,
                    container = %removed.container_name,
                    "Removing idle LSP container"
                );
                self.remove_container(&removed.container_name).await;
            }
        }

        self.evict_idle_pool(&mut state, ttl).await;
        self.ensure_min_idle(&mut state).await;

        debug!(
            active_sessions_before = before,
            removed = expired.len(),
            active_sessions_after = state.sessions.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "LSP cleanup evaluated"
        );
    }

    /// Remove every active and idle container. Used on gateway shutdown.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let sessions: Vec<ContainerSession> = state.sessions.drain().map(|(_, s)| s).collect();
        let idle: Vec<IdleContainer> = state.idle.drain(..).collect();
        for session in sessions {
            self.remove_container(&session.container_name).await;
        }
        for container in idle {
            self.remove_container(&container.container_name).await;
        }
    }

    pub async fn active_session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Current reference count for a workspace, if it has a container.
    pub async fn ref_count(&self, workspace_key: &str) -> Option<u32> {
        self.state
            .lock()
            .await
            .sessions
            .get(workspace_key)
            .map(|s| s.ref_count)
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_runtime_available(&self) -> bool {
        self.runtime_available.load(Ordering::SeqCst)
    }

    pub async fn is_image_available(&self) -> bool {
        if !self.is_runtime_available() {
            return false;
        }
        self.runtime
            .run(&args(["image", "inspect", self.config.image.as_str()]))
            .await
            .success()
    }

    pub async fn snapshot(&self) -> SaturationSnapshot {
        let state = self.state.lock().await;
        let c = &state.counters;
        SaturationSnapshot {
            acquire_attempts: c.acquire_attempts,
            acquire_reuse_count: c.acquire_reuse_count,
            acquire_create_count: c.acquire_create_count,
            acquire_idle_pool_hit_count: c.acquire_idle_pool_hit_count,
            acquire_idle_pool_miss_count: c.acquire_idle_pool_miss_count,
            acquire_failure_count: c.acquire_failure_count,
            saturation_reject_count: c.saturation_reject_count,
            active_sessions: state.sessions.len(),
            idle_pool_size: state.idle.len(),
            max_sessions: self.config.max_sessions,
            last_saturation_epoch_ms: c.last_saturation_epoch_ms,
            last_saturation_workspace_key: c.last_saturation_workspace_key.clone(),
            idle_pool_create_count: c.idle_pool_create_count,
            idle_pool_evict_count: c.idle_pool_evict_count,
        }
    }

    async fn ensure_min_idle(&self, state: &mut PoolState) {
        if !self.config.enabled || !self.is_runtime_available() {
            return;
        }
        while state.idle.len() < self.config.min_idle_containers {
            state.idle_seq += 1;
            let name = format!("{}{}{:x}", CONTAINER_PREFIX, IDLE_POOL_PREFIX, state.idle_seq);
            if !self.create_and_start(&name).await {
                warn!(container = %name, idle_pool_size = state.idle.len(), "LSP idle pool create failed");
                return;
            }
            state.idle.push_back(IdleContainer {
                container_name: name.clone(),
                created: Instant::now(),
            });
            state.counters.idle_pool_create_count += 1;
            debug!(container = %name, idle_pool_size = state.idle.len(), "LSP idle pool container ready");
        }
    }

    async fn evict_idle_pool(&self, state: &mut PoolState, ttl: Duration) {
        let target = self.config.min_idle_containers;
        while state.idle.len() > target {
            let Some(position) = state.idle.iter().position(|c| c.created.elapsed() > ttl) else {
                break;
            };
            if let Some(evicted) = state.idle.remove(position) {
                self.remove_container(&evicted.container_name).await;
                state.counters.idle_pool_evict_count += 1;
                debug!(
                    container = %evicted.container_name,
                    idle_pool_size = state.idle.len(),
                    "LSP idle pool evicted"
                );
            }
        }
    }

    async fn create_and_start(&self, name: &str) -> bool {
        let started = Instant::now();
        // Clear any orphan left behind by a previous gateway process.
        let rm = self.runtime.run(&args(["rm", "-f", name])).await;

        let create = self.runtime.run(&self.create_args(name)).await;
        if !create.success() {
            error!(
                container = %name,
                create_ms = create.duration.as_millis() as u64,
                output = %create.output,
                "Failed to create LSP container"
            );
            return false;
        }

        let start = self.runtime.run(&args(["start", name])).await;
        if !start.success() {
            error!(
                container = %name,
                start_ms = start.duration.as_millis() as u64,
                output = %start.output,
                "Failed to start LSP container"
            );
            self.remove_container(name).await;
            return false;
        }

        debug!(
            container = %name,
            rm_ms = rm.duration.as_millis() as u64,
            create_ms = create.duration.as_millis() as u64,
            start_ms = start.duration.as_millis() as u64,
            total_ms = started.elapsed().as_millis() as u64,
            "LSP container ready"
        );
        true
    }

    async fn remove_container(&self, name: &str) {
        let out = self.runtime.run(&args(["rm", "-f", name])).await;
        if !out.success() {
            warn!(container = %name, output = %out.output, "Failed to remove LSP container");
        }
    }

    fn create_args(&self, name: &str) -> Vec<String> {
        let c = &self.config;
        vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
            format!("--memory={}m", c.memory_mb),
            format!("--cpus={}", c.cpus),
            format!("--pids-limit={}", c.pids_limit),
            "--network=none".to_string(),
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            "/tmp:rw,size=256m,mode=1777".to_string(),
            "--tmpfs".to_string(),
            format!("/home/{}/.eclipse:rw,size=128m,mode=1777", c.container_user),
            "--security-opt=no-new-privileges".to_string(),
            "--cap-drop=ALL".to_string(),
            format!("--user={}", c.container_user),
            c.image.clone(),
            "tail".to_string(),
            "-f".to_string(),
            "/dev/null".to_string(),
        ]
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
