//! In-memory doubles for the container runtime, bridges and task spawning.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::bridge::{Bridge, BridgeFactory};
use super::connection::{ClientConnection, ConnectionSet};
use super::prewarm::TaskSpawner;
use super::runtime::{CommandOutput, ContainerRuntime};
use crate::errors::{BridgeError, CloseKind};

/// Records every CLI invocation; succeeds unless the subcommand was failed.
#[derive(Default)]
pub struct FakeRuntime {
    calls: Mutex<Vec<Vec<String>>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_subcommand(&self, subcommand: &str) {
        self.failing.lock().unwrap().insert(subcommand.to_string());
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_subcommand(&self, subcommand: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some(subcommand))
            .count()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run(&self, args: &[String]) -> CommandOutput {
        self.calls.lock().unwrap().push(args.to_vec());
        let failed = args
            .first()
            .is_some_and(|sub| self.failing.lock().unwrap().contains(sub));
        CommandOutput {
            exit_code: if failed { 1 } else { 0 },
            output: if failed { "simulated failure".to_string() } else { String::new() },
            duration: Duration::ZERO,
        }
    }

    fn program(&self) -> &str {
        "docker"
    }
}

/// Bridge that records calls instead of running a process.
pub struct FakeBridge {
    container_name: String,
    connections: ConnectionSet,
    starts: AtomicUsize,
    closes: AtomicUsize,
    closed: AtomicBool,
    fail_start: bool,
    start_delay: Duration,
    sent: Mutex<Vec<String>>,
}

impl FakeBridge {
    /// `start()` sleeps for `start_delay` before it resolves.
    pub fn new(container_name: &str, fail_start: bool, start_delay: Duration) -> Self {
        Self {
            container_name: container_name.to_string(),
            connections: ConnectionSet::new(),
            starts: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            fail_start,
            start_delay,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Deliver a backend message to every attachment.
    pub fn emit(&self, message: &str) -> usize {
        self.connections.broadcast(message)
    }

    /// Simulate the backend process dying.
    pub fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connections.close_all(CloseKind::ServerError);
    }
}

#[async_trait]
impl Bridge for FakeBridge {
    fn container_name(&self) -> &str {
        &self.container_name
    }

    async fn start(&self) -> Result<(), BridgeError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if self.fail_start {
            self.closed.store(true, Ordering::SeqCst);
            return Err(BridgeError::StartupFailed {
                container: self.container_name.clone(),
                stderr_tail: "jdtls binary not found".to_string(),
            });
        }
        Ok(())
    }

    fn attach(&self, connection: ClientConnection) {
        self.connections.attach(connection);
    }

    fn detach(&self, connection_id: &str) {
        self.connections.detach(connection_id);
    }

    async fn send_client_message(&self, payload: &str) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::NotRunning);
        }
        self.sent.lock().unwrap().push(payload.to_string());
        Ok(())
    }

    fn attached_count(&self) -> usize {
        self.connections.len()
    }

    fn last_attached(&self) -> Instant {
        self.connections.last_attached()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.connections.close_all(CloseKind::ServerError);
    }
}

/// Hands out `FakeBridge`s and keeps them for inspection.
#[derive(Default)]
pub struct FakeBridgeFactory {
    bridges: Mutex<Vec<Arc<FakeBridge>>>,
    fail_start: AtomicBool,
    start_delay: Mutex<Duration>,
}

impl FakeBridgeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = delay;
    }

    pub fn bridges(&self) -> Vec<Arc<FakeBridge>> {
        self.bridges.lock().unwrap().clone()
    }

    pub fn created(&self) -> usize {
        self.bridges.lock().unwrap().len()
    }

    pub fn total_starts(&self) -> usize {
        self.bridges().iter().map(|b| b.start_count()).sum()
    }
}

impl BridgeFactory for FakeBridgeFactory {
    fn create(&self, container_name: &str, _workspace_key: &str) -> Arc<dyn Bridge> {
        let bridge = Arc::new(FakeBridge::new(
            container_name,
            self.fail_start.load(Ordering::SeqCst),
            *self.start_delay.lock().unwrap(),
        ));
        self.bridges.lock().unwrap().push(Arc::clone(&bridge));
        bridge
    }
}

/// Queues spawned tasks until the test runs them.
#[derive(Default)]
pub struct ManualSpawner {
    tasks: Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl ManualSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Drop queued tasks without polling them.
    pub fn discard_all(&self) {
        self.tasks.lock().unwrap().clear();
    }

    pub async fn run_all(&self) {
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.await;
        }
    }
}

impl TaskSpawner for ManualSpawner {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        self.tasks.lock().unwrap().push(task);
    }
}
