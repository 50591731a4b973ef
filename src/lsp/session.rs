//! Session manager: the façade the WebSocket layer talks to.
//!
//! Maps client connections to workspace keys and workspace keys to bridges.
//! Both maps sit behind one `std::sync::Mutex` that is never held across an
//! `.await`; opens for the same workspace are serialized by a per-workspace
//! async lock so concurrent connections share a single bridge and process.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::bridge::{Bridge, BridgeFactory};
use super::connection::ClientConnection;
use super::naming;
use super::pool::ContainerPool;
use crate::config::LspConfig;
use crate::errors::{BridgeError, SessionError};

#[derive(Default)]
struct SessionState {
    bridges: HashMap<String, Arc<dyn Bridge>>,
    /// connection id → workspace key
    connections: HashMap<String, String>,
}

/// One pool reference taken on behalf of an open or a prewarm.
///
/// If the owning future is dropped before the reference is handed off or
/// released, the release runs on a spawned task so the entry can age out.
struct ContainerLease {
    pool: Arc<ContainerPool>,
    workspace_key: String,
    held: bool,
}

impl ContainerLease {
    fn new(pool: &Arc<ContainerPool>, workspace_key: &str) -> Self {
        Self {
            pool: Arc::clone(pool),
            workspace_key: workspace_key.to_string(),
            held: true,
        }
    }

    /// The reference now belongs to a connection, or was already removed.
    fn hand_off(mut self) {
        self.held = false;
    }

    async fn release(mut self) {
        self.held = false;
        self.pool.release(&self.workspace_key).await;
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let pool = Arc::clone(&self.pool);
        let workspace_key = std::mem::take(&mut self.workspace_key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            warn!(workspace_key = %workspace_key, "LSP bridge setup cancelled; releasing container reference");
            handle.spawn(async move { pool.release(&workspace_key).await });
        }
    }
}

pub struct SessionManager {
    config: LspConfig,
    pool: Arc<ContainerPool>,
    factory: Arc<dyn BridgeFactory>,
    state: Mutex<SessionState>,
    open_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(config: LspConfig, pool: Arc<ContainerPool>, factory: Arc<dyn BridgeFactory>) -> Self {
        Self {
            config,
            pool,
            factory,
            state: Mutex::new(SessionState::default()),
            open_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<ContainerPool> {
        &self.pool
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_lock(&self, workspace_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.open_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(workspace_key.to_string()).or_default())
    }

    /// Bind a new client connection to its workspace's bridge, starting one if needed.
    pub async fn open(&self, connection: ClientConnection) -> Result<(), SessionError> {
        let started = Instant::now();
        let workspace_key = naming::workspace_key(
            connection.principal.as_deref(),
            connection.session_id.as_deref(),
            &connection.id,
        );
        let lock = self.open_lock(&workspace_key);
        let _guard = lock.lock().await;

        self.discard_dead_bridge(&workspace_key).await;

        let acquire_started = Instant::now();
        let Some(container) = self.pool.acquire(&workspace_key).await else {
            warn!(
                connection_id = %connection.id,
                workspace_key = %workspace_key,
                "No LSP container available"
            );
            return Err(SessionError::BackendUnavailable);
        };
        let lease = ContainerLease::new(&self.pool, &workspace_key);
        let acquire_ms = acquire_started.elapsed().as_millis() as u64;

        let bridge = match self
            .ensure_bridge(&workspace_key, &container, self.config.connect_timeout)
            .await
        {
            Ok(bridge) => bridge,
            Err(e) => {
                // The failed start already force-removed the entry.
                lease.hand_off();
                return Err(e);
            }
        };
        lease.hand_off();
        let connection_id = connection.id.clone();
        bridge.attach(connection);
        self.state()
            .connections
            .insert(connection_id.clone(), workspace_key.clone());

        info!(
            connection_id = %connection_id,
            workspace_key = %workspace_key,
            container = %container,
            attached = bridge.attached_count(),
            acquire_ms,
            total_ms = started.elapsed().as_millis() as u64,
            "LSP connection opened"
        );
        Ok(())
    }

    /// Forward one client message to the connection's bridge.
    pub async fn forward_client_message(
        &self,
        connection_id: &str,
        payload: &str,
    ) -> Result<(), SessionError> {
        let size = payload.len();
        if size > self.config.max_message_bytes {
            return Err(SessionError::PayloadTooLarge {
                size,
                limit: self.config.max_message_bytes,
            });
        }

        let bridge = {
            let state = self.state();
            state
                .connections
                .get(connection_id)
                .and_then(|workspace_key| state.bridges.get(workspace_key).cloned())
        };
        let Some(bridge) = bridge else {
            return Err(SessionError::NoBridge {
                connection_id: connection_id.to_string(),
            });
        };

        bridge.send_client_message(payload).await?;
        Ok(())
    }

    /// Detach the connection and release its container reference. Unknown ids are ignored.
    pub async fn close(&self, connection_id: &str) {
        let (workspace_key, bridge) = {
            let mut state = self.state();
            let Some(workspace_key) = state.connections.remove(connection_id) else {
                return;
            };
            let bridge = state.bridges.get(&workspace_key).cloned();
            (workspace_key, bridge)
        };

        if let Some(bridge) = bridge {
            bridge.detach(connection_id);
        }
        self.pool.release(&workspace_key).await;
        debug!(connection_id, workspace_key = %workspace_key, "LSP connection closed");
    }

    /// Close bridges that are dead, or unattached and idle past the TTL,
    /// and force-remove their containers.
    pub async fn cleanup_idle_bridges(&self) {
        let candidates: Vec<String> = {
            let state = self.state();
            state
                .bridges
                .iter()
                .filter(|(_, bridge)| self.is_reclaimable(bridge))
                .map(|(key, _)| key.clone())
                .collect()
        };

        for workspace_key in candidates {
            let lock = self.open_lock(&workspace_key);
            let _guard = lock.lock().await;

            let removed = {
                let mut state = self.state();
                let reclaimable = state
                    .bridges
                    .get(&workspace_key)
                    .is_some_and(|bridge| self.is_reclaimable(bridge));
                if reclaimable {
                    state
                        .connections
                        .retain(|_, key| key.as_str() != workspace_key.as_str());
                    state.bridges.remove(&workspace_key)
                } else {
                    None
                }
            };
            let Some(bridge) = removed else {
                continue;
            };

            bridge.close().await;
            self.pool.force_remove(&workspace_key).await;
            debug!(
                workspace_key = %workspace_key,
                container = %bridge.container_name(),
                "Removed idle LSP bridge"
            );
        }

        self.prune_open_locks();
    }

    /// Periodic sweep: reclaim idle bridges first, then let the pool evict
    /// idle containers that no surviving bridge still runs in.
    pub async fn cleanup_idle(&self) {
        self.cleanup_idle_bridges().await;
        let in_use = self.bridged_workspace_keys();
        self.pool.cleanup_idle_except(&in_use).await;
    }

    /// Workspace keys that currently have a bridge, live or not yet reclaimed.
    pub fn bridged_workspace_keys(&self) -> HashSet<String> {
        self.state().bridges.keys().cloned().collect()
    }

    /// Workspace key a login with this principal and session id will map to.
    pub fn workspace_key_for_session(&self, principal: &str, session_id: &str) -> String {
        naming::workspace_key(Some(principal), Some(session_id), session_id)
    }

    pub fn has_bridge_for_workspace_key(&self, workspace_key: &str) -> bool {
        self.state()
            .bridges
            .get(workspace_key)
            .is_some_and(|bridge| !bridge.is_closed())
    }

    /// Project folder URI the editor should use for this connection.
    pub fn workspace_uri_for_connection(&self, connection_id: &str) -> Option<String> {
        self.state()
            .connections
            .get(connection_id)
            .map(|workspace_key| naming::workspace_uri(workspace_key))
    }

    pub fn active_bridge_count(&self) -> usize {
        self.state().bridges.len()
    }

    /// Start a backend for `workspace_key` without attaching anyone, within
    /// `prewarm_timeout`.
    ///
    /// The container reference taken here is released right away, so an
    /// unused warm workspace ages out through the ordinary idle sweeps. A
    /// start that overruns the deadline is torn down like any failed start.
    pub async fn prewarm_workspace(&self, workspace_key: &str) -> Result<(), SessionError> {
        let timeout = self.config.prewarm_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let timed_out = || SessionError::PrewarmTimeout {
            workspace_key: workspace_key.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };

        let lock = self.open_lock(workspace_key);
        let Ok(_guard) = tokio::time::timeout_at(deadline, lock.lock()).await else {
            return Err(timed_out());
        };

        if self.has_bridge_for_workspace_key(workspace_key) {
            return Ok(());
        }
        self.discard_dead_bridge(workspace_key).await;

        let Some(container) = self.pool.acquire(workspace_key).await else {
            return Err(SessionError::BackendUnavailable);
        };
        let lease = ContainerLease::new(&self.pool, workspace_key);

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            lease.release().await;
            return Err(timed_out());
        }
        let start_timeout = remaining.min(self.config.connect_timeout);
        let result = self.ensure_bridge(workspace_key, &container, start_timeout).await;
        lease.release().await;
        result.map(|_| ())
    }

    /// Close every bridge. Containers are left to the pool's own shutdown.
    pub async fn shutdown(&self) {
        let bridges: Vec<Arc<dyn Bridge>> = {
            let mut state = self.state();
            state.connections.clear();
            state.bridges.drain().map(|(_, bridge)| bridge).collect()
        };
        let count = bridges.len();
        for bridge in bridges {
            bridge.close().await;
        }
        info!(bridges = count, "LSP sessions shut down");
    }

    fn is_reclaimable(&self, bridge: &Arc<dyn Bridge>) -> bool {
        bridge.is_closed()
            || (bridge.attached_count() == 0 && bridge.last_attached().elapsed() > self.config.idle_ttl)
    }

    /// Return the live bridge for the key, or create and start one on `container`.
    ///
    /// Must be called with the workspace's open lock held.
    async fn ensure_bridge(
        &self,
        workspace_key: &str,
        container: &str,
        start_timeout: Duration,
    ) -> Result<Arc<dyn Bridge>, SessionError> {
        let existing = self.state().bridges.get(workspace_key).cloned();
        if let Some(bridge) = existing {
            if bridge.container_name() == container && !bridge.is_closed() {
                return Ok(bridge);
            }
            // The pool rebound the key to another container, or the process
            // died; either way the old bridge cannot serve this container.
            warn!(
                workspace_key,
                stale_container = %bridge.container_name(),
                container,
                closed = bridge.is_closed(),
                "Replacing stale LSP bridge"
            );
            self.state().bridges.remove(workspace_key);
            bridge.close().await;
        }

        let started = Instant::now();
        let bridge = self.factory.create(container, workspace_key);
        let result = match tokio::time::timeout(start_timeout, bridge.start()).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::StartTimeout {
                container: container.to_string(),
                timeout_ms: start_timeout.as_millis() as u64,
            }),
        };
        if let Err(e) = result {
            warn!(workspace_key, container, error = %e, "LSP bridge failed to start");
            bridge.close().await;
            self.pool.force_remove(workspace_key).await;
            return Err(e.into());
        }

        debug!(
            workspace_key,
            container,
            bridge_start_ms = started.elapsed().as_millis() as u64,
            "LSP bridge created"
        );
        self.state()
            .bridges
            .insert(workspace_key.to_string(), Arc::clone(&bridge));
        Ok(bridge)
    }

    /// Drop a bridge whose backend died, along with its container and the
    /// records of the connections it already closed.
    async fn discard_dead_bridge(&self, workspace_key: &str) {
        let dead = {
            let mut state = self.state();
            let is_dead = state
                .bridges
                .get(workspace_key)
                .is_some_and(|bridge| bridge.is_closed());
            if !is_dead {
                return;
            }
            state
                .connections
                .retain(|_, key| key.as_str() != workspace_key);
            state.bridges.remove(workspace_key)
        };

        if let Some(bridge) = dead {
            warn!(
                workspace_key,
                container = %bridge.container_name(),
                "Discarding terminated LSP bridge"
            );
            bridge.close().await;
            self.pool.force_remove(workspace_key).await;
        }
    }

    fn prune_open_locks(&self) {
        let state = self.state();
        let mut locks = self.open_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|key, lock| Arc::strong_count(lock) > 1 || state.bridges.contains_key(key));
    }
}
