//! Bridge between attached client connections and one language-server
//! process running inside a container.
//!
//! A bridge owns exactly two background tasks: the stdout pump, which
//! decodes framed backend messages and fans them out to every attached
//! connection, and the stderr drain, which logs backend diagnostics and
//! keeps a short tail for startup errors. Both live in one `JoinSet` and are
//! stopped together through a `CancellationToken`.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::{ClientConnection, ConnectionSet};
use super::framing;
use super::naming::workspace_dir;
use crate::config::LspConfig;
use crate::errors::{BridgeError, CloseKind};

const STDERR_TAIL_LINES: usize = 12;
const LIVENESS_POLL: Duration = Duration::from_millis(50);
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// One backend process and the connections multiplexed onto it.
#[async_trait]
pub trait Bridge: Send + Sync {
    fn container_name(&self) -> &str;

    /// Launch the backend process. A no-op while the process is alive.
    async fn start(&self) -> Result<(), BridgeError>;

    fn attach(&self, connection: ClientConnection);

    fn detach(&self, connection_id: &str);

    /// Frame `payload` and write it to the backend's stdin.
    async fn send_client_message(&self, payload: &str) -> Result<(), BridgeError>;

    fn attached_count(&self) -> usize;

    /// When a connection was last attached, or the last one detached.
    fn last_attached(&self) -> Instant;

    fn is_closed(&self) -> bool;

    /// Stop the backend process and drop all attachments. Idempotent.
    async fn close(&self);
}

/// Creates bridges for the session manager.
/// Real implementation: `DockerBridgeFactory`.
pub trait BridgeFactory: Send + Sync {
    fn create(&self, container_name: &str, workspace_key: &str) -> Arc<dyn Bridge>;
}

/// Program and arguments that launch the language server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl BridgeCommand {
    /// `<runtime> exec -i --user <user> <container> sh -c <start script>`
    pub fn container_exec(config: &LspConfig, container_name: &str, workspace_key: &str) -> Self {
        Self {
            program: config.runtime_cmd.clone(),
            args: vec![
                "exec".to_string(),
                "-i".to_string(),
                "--user".to_string(),
                config.container_user.clone(),
                container_name.to_string(),
                "sh".to_string(),
                "-c".to_string(),
                start_script(&workspace_dir(workspace_key)),
            ],
        }
    }
}

/// Shell script that prepares the workspace directory and execs the first
/// language-server binary it finds.
pub fn start_script(workspace_dir: &str) -> String {
    format!(
        "mkdir -p {dir}/project/src && \
         if [ -x /opt/jdtls/bin/jdtls ]; then exec env HOME=/tmp /opt/jdtls/bin/jdtls -data {dir}; \
         elif [ -x /opt/jdtls/jdtls ]; then exec env HOME=/tmp /opt/jdtls/jdtls -data {dir}; \
         elif command -v jdtls >/dev/null 2>&1; then exec env HOME=/tmp jdtls -data {dir}; \
         else echo 'jdtls binary not found' >&2; exit 127; fi",
        dir = workspace_dir
    )
}

/// Builds `LspBridge`s that exec the language server through the container CLI.
pub struct DockerBridgeFactory {
    config: LspConfig,
}

impl DockerBridgeFactory {
    pub fn new(config: LspConfig) -> Self {
        Self { config }
    }
}

impl BridgeFactory for DockerBridgeFactory {
    fn create(&self, container_name: &str, workspace_key: &str) -> Arc<dyn Bridge> {
        Arc::new(LspBridge::new(
            container_name,
            workspace_key,
            BridgeCommand::container_exec(&self.config, container_name, workspace_key),
            self.config.startup_grace,
        ))
    }
}

#[derive(Default)]
struct BridgeProcess {
    child: Option<Child>,
    pumps: JoinSet<()>,
    cancel: CancellationToken,
}

/// Process-backed bridge.
pub struct LspBridge {
    container_name: String,
    workspace_key: String,
    command: BridgeCommand,
    startup_grace: Duration,
    connections: Arc<ConnectionSet>,
    closed: Arc<AtomicBool>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    process: tokio::sync::Mutex<BridgeProcess>,
}

impl LspBridge {
    pub fn new(
        container_name: impl Into<String>,
        workspace_key: impl Into<String>,
        command: BridgeCommand,
        startup_grace: Duration,
    ) -> Self {
        Self {
            container_name: container_name.into(),
            workspace_key: workspace_key.into(),
            command,
            startup_grace,
            connections: Arc::new(ConnectionSet::new()),
            closed: Arc::new(AtomicBool::new(false)),
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
            stdin: tokio::sync::Mutex::new(None),
            process: tokio::sync::Mutex::new(BridgeProcess::default()),
        }
    }

    /// Last stderr lines of the backend, joined with ` || `.
    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(PoisonError::into_inner);
        tail.iter().map(String::as_str).collect::<Vec<_>>().join(" || ")
    }

    fn spawn_process(&self) -> Result<Child, BridgeError> {
        Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                container: self.container_name.clone(),
                source,
            })
    }
}

#[async_trait]
impl Bridge for LspBridge {
    fn container_name(&self) -> &str {
        &self.container_name
    }

    async fn start(&self) -> Result<(), BridgeError> {
        let started = Instant::now();
        let mut process = self.process.lock().await;
        if let Some(child) = process.child.as_mut()
            && matches!(child.try_wait(), Ok(None))
        {
            return Ok(());
        }

        let mut child = self.spawn_process()?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill().await;
            return Err(BridgeError::NotRunning);
        };

        self.stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self.stdin.lock().await = Some(stdin);
        self.closed.store(false, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let mut pumps = JoinSet::new();
        pumps.spawn(pump_backend_output(
            stdout,
            Arc::clone(&self.connections),
            Arc::clone(&self.closed),
            cancel.clone(),
            self.container_name.clone(),
            started,
        ));
        pumps.spawn(drain_stderr(
            stderr,
            Arc::clone(&self.stderr_tail),
            cancel.clone(),
            self.container_name.clone(),
        ));

        let early_exit = wait_for_early_exit(&mut child, self.startup_grace).await;
        process.child = Some(child);
        process.pumps = pumps;
        process.cancel = cancel;

        if let Some(exit_code) = early_exit {
            // Let the drain collect whatever the process printed before exiting.
            let _ = tokio::time::timeout(PUMP_DRAIN_TIMEOUT, async {
                while process.pumps.join_next().await.is_some() {}
            })
            .await;
            process.cancel.cancel();
            process.pumps.shutdown().await;
            process.child = None;
            self.stdin.lock().await.take();
            self.closed.store(true, Ordering::SeqCst);

            let stderr_tail = self.stderr_tail();
            error!(
                container = %self.container_name,
                workspace_key = %self.workspace_key,
                exit_code,
                stderr_tail = %stderr_tail,
                "LSP process exited during startup"
            );
            return Err(BridgeError::StartupFailed {
                container: self.container_name.clone(),
                stderr_tail,
            });
        }

        info!(
            container = %self.container_name,
            workspace_key = %self.workspace_key,
            startup_ms = started.elapsed().as_millis() as u64,
            "LSP bridge started"
        );
        Ok(())
    }

    fn attach(&self, connection: ClientConnection) {
        debug!(
            container = %self.container_name,
            connection_id = %connection.id,
            "LSP connection attached"
        );
        self.connections.attach(connection);
    }

    fn detach(&self, connection_id: &str) {
        self.connections.detach(connection_id);
        debug!(
            container = %self.container_name,
            connection_id,
            attached = self.connections.len(),
            "LSP connection detached"
        );
    }

    async fn send_client_message(&self, payload: &str) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::NotRunning);
        }
        let mut stdin = self.stdin.lock().await;
        let Some(writer) = stdin.as_mut() else {
            return Err(BridgeError::NotRunning);
        };
        framing::write_message(writer, payload).await?;
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
        let mut process = self.process.lock().await;
        let was_closed = self.closed.swap(true, Ordering::SeqCst);
        if was_closed && process.child.is_none() {
            return;
        }

        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
        if let Some(mut child) = process.child.take() {
            terminate(&mut child, &self.container_name).await;
        }
        process.cancel.cancel();
        process.pumps.shutdown().await;
        self.connections.close_all(CloseKind::ServerError);

        info!(
            container = %self.container_name,
            workspace_key = %self.workspace_key,
            "LSP bridge closed"
        );
    }
}

/// Poll the child every 50 ms for `grace`. Returns the exit code if it died.
async fn wait_for_early_exit(child: &mut Child, grace: Duration) -> Option<i32> {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status.code().unwrap_or(-1)),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Failed to poll LSP process");
                return Some(-1);
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        tokio::time::sleep(LIVENESS_POLL.min(deadline - now)).await;
    }
}

async fn terminate(child: &mut Child, container: &str) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }
    request_graceful_exit(child);
    if tokio::time::timeout(CLOSE_GRACE, child.wait()).await.is_err() {
        warn!(container, "LSP process ignored termination request, killing");
        if let Err(e) = child.kill().await {
            warn!(container, error = %e, "Failed to kill LSP process");
        }
    }
}

#[cfg(unix)]
fn request_graceful_exit(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` belongs to a child we spawned and have not reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn request_graceful_exit(_child: &Child) {}

async fn pump_backend_output(
    stdout: ChildStdout,
    connections: Arc<ConnectionSet>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
    container: String,
    started: Instant,
) {
    let mut reader = BufReader::new(stdout);
    let mut forwarded: u64 = 0;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = framing::read_message(&mut reader) => next,
        };
        match next {
            Ok(Some(message)) => {
                if forwarded == 0 {
                    debug!(
                        container = %container,
                        first_message_ms = started.elapsed().as_millis() as u64,
                        "LSP first backend message"
                    );
                }
                forwarded += 1;
                connections.broadcast(&message);
            }
            Ok(None) => {
                debug!(container = %container, forwarded, "LSP backend output ended");
                break;
            }
            Err(e) => {
                warn!(container = %container, error = %e, "LSP backend output unreadable");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    connections.close_all(CloseKind::ServerError);
}

async fn drain_stderr(
    stderr: ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
    cancel: CancellationToken,
    container: String,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };
        let Ok(Some(line)) = line else {
            return;
        };
        debug!(container = %container, line = %line, "LSP stderr");
        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::connection::Outbound;

    fn shell_bridge(script: &str) -> LspBridge {
        LspBridge::new(
            "lsp-test",
            "alice:http-1",
            BridgeCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
            },
            Duration::from_millis(200),
        )
    }

    async fn recv(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Outbound>) -> Outbound {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("channel closed")
    }

    #[test]
    fn test_container_exec_command() {
        let config = LspConfig::default();
        let cmd = BridgeCommand::container_exec(&config, "proginator-jdtls-abc", "alice:http-1");
        assert_eq!(cmd.program, "docker");
        assert_eq!(
            &cmd.args[..7],
            &["exec", "-i", "--user", "runner", "proginator-jdtls-abc", "sh", "-c"]
        );
        assert!(cmd.args[7].starts_with("mkdir -p /tmp/workspaces/alice_http-1/project/src && "));
        assert!(cmd.args[7].contains("-data /tmp/workspaces/alice_http-1;"));
    }

    #[test]
    fn test_start_script_falls_back_through_binaries() {
        let script = start_script("/tmp/workspaces/k");
        let bin = script.find("/opt/jdtls/bin/jdtls").unwrap();
        let opt = script.find("/opt/jdtls/jdtls").unwrap();
        let path = script.find("command -v jdtls").unwrap();
        assert!(bin < opt && opt < path);
        assert!(script.ends_with("else echo 'jdtls binary not found' >&2; exit 127; fi"));
    }

    #[tokio::test]
    async fn test_startup_failure_carries_stderr_tail() {
        let bridge = shell_bridge("echo 'jdtls binary not found' >&2; exit 127");
        let err = bridge.start().await.unwrap_err();
        match err {
            BridgeError::StartupFailed {
                container,
                stderr_tail,
            } => {
                assert_eq!(container, "lsp-test");
                assert!(stderr_tail.contains("jdtls binary not found"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(bridge.is_closed());
    }

    #[tokio::test]
    async fn test_stderr_tail_keeps_last_lines() {
        let bridge = shell_bridge("for i in $(seq 1 20); do echo line$i >&2; done; exit 1");
        assert!(bridge.start().await.is_err());
        let tail = bridge.stderr_tail();
        assert!(tail.starts_with("line9 || "));
        assert!(tail.ends_with("line20"));
        assert_eq!(tail.split(" || ").count(), STDERR_TAIL_LINES);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let bridge = LspBridge::new(
            "lsp-test",
            "alice:http-1",
            BridgeCommand {
                program: "definitely-not-a-binary-xyz".to_string(),
                args: vec![],
            },
            Duration::from_millis(10),
        );
        assert!(matches!(
            bridge.start().await,
            Err(BridgeError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_fan_out_to_every_attachment() {
        // `cat` echoes framed client messages back as backend output.
        let bridge = shell_bridge("exec cat");
        bridge.start().await.unwrap();
        bridge.start().await.unwrap();

        let (a, mut rx_a) = ClientConnection::new("a", None, None);
        let (b, mut rx_b) = ClientConnection::new("b", None, None);
        bridge.attach(a);
        bridge.attach(b);
        assert_eq!(bridge.attached_count(), 2);

        bridge.send_client_message(r#"{"id":1}"#).await.unwrap();
        bridge.send_client_message(r#"{"id":2}"#).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(recv(rx).await, Outbound::Text(r#"{"id":1}"#.into()));
            assert_eq!(recv(rx).await, Outbound::Text(r#"{"id":2}"#.into()));
        }
        bridge.close().await;
    }

    #[tokio::test]
    async fn test_dead_attachment_does_not_affect_others() {
        let bridge = shell_bridge("exec cat");
        bridge.start().await.unwrap();

        let (a, rx_a) = ClientConnection::new("a", None, None);
        let (b, mut rx_b) = ClientConnection::new("b", None, None);
        bridge.attach(a);
        bridge.attach(b);
        drop(rx_a);

        bridge.send_client_message("hello").await.unwrap();
        assert_eq!(recv(&mut rx_b).await, Outbound::Text("hello".into()));
        assert_eq!(bridge.attached_count(), 1);
        bridge.close().await;
    }

    #[tokio::test]
    async fn test_process_exit_closes_attachments() {
        let bridge = shell_bridge("sleep 0.4");
        bridge.start().await.unwrap();
        let (a, mut rx) = ClientConnection::new("a", None, None);
        bridge.attach(a);

        assert_eq!(recv(&mut rx).await, Outbound::Close(CloseKind::ServerError));
        assert!(bridge.is_closed());
        assert!(matches!(
            bridge.send_client_message("late").await,
            Err(BridgeError::NotRunning)
        ));
        bridge.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_sends() {
        let bridge = shell_bridge("exec cat");
        bridge.start().await.unwrap();
        let (a, mut rx) = ClientConnection::new("a", None, None);
        bridge.attach(a);

        bridge.close().await;
        bridge.close().await;

        assert!(bridge.is_closed());
        assert_eq!(bridge.attached_count(), 0);
        assert_eq!(recv(&mut rx).await, Outbound::Close(CloseKind::ServerError));
        assert!(matches!(
            bridge.send_client_message("x").await,
            Err(BridgeError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_close_kills_process_ignoring_termination() {
        let bridge = shell_bridge("trap '' TERM; while true; do sleep 0.1; done");
        bridge.start().await.unwrap();
        let started = Instant::now();
        bridge.close().await;
        assert!(bridge.is_closed());
        assert!(started.elapsed() >= CLOSE_GRACE);
    }
}
