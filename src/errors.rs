//! Typed error hierarchy for the LSP gateway.
//!
//! Three enums cover the three layers a client message passes through:
//! - `FramingError`: malformed `Content-Length` framing on the backend pipe
//! - `BridgeError`: backend process startup and transport failures
//! - `SessionError`: connection-level failures surfaced to the WebSocket

use thiserror::Error;

/// Errors from reading or writing a framed backend message.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("Missing Content-Length header in LSP message")]
    MissingContentLength,

    #[error("Invalid Content-Length value '{value}'")]
    InvalidContentLength { value: String },

    #[error("LSP header line exceeds {limit} bytes")]
    HeaderTooLong { limit: usize },

    #[error("LSP message body is not valid UTF-8")]
    InvalidUtf8(#[source] std::string::FromUtf8Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from a single backend bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to spawn language server process in container {container}: {source}")]
    Spawn {
        container: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Language server failed to start in container {container} stderrTail=\"{stderr_tail}\"")]
    StartupFailed {
        container: String,
        stderr_tail: String,
    },

    #[error("Language server in container {container} did not start within {timeout_ms}ms")]
    StartTimeout { container: String, timeout_ms: u64 },

    #[error("LSP backend process is not running")]
    NotRunning,

    #[error("LSP backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Framing(#[from] FramingError),
}

/// How a WebSocket connection should be closed after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// The client sent something we refuse to forward.
    ClientError,
    /// The backend side is gone or unavailable.
    ServerError,
}

/// Errors from the session manager, one per client connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No available LSP backend container")]
    BackendUnavailable,

    #[error("LSP payload exceeds max size ({size} > {limit} bytes)")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("No active LSP bridge for connection {connection_id}")]
    NoBridge { connection_id: String },

    #[error("Prewarm of {workspace_key} did not finish within {timeout_ms}ms")]
    PrewarmTimeout { workspace_key: String, timeout_ms: u64 },

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl SessionError {
    /// True when the work was abandoned because a deadline passed.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SessionError::PrewarmTimeout { .. }
                | SessionError::Bridge(BridgeError::StartTimeout { .. })
        )
    }

    /// Client-caused failures close with a client-error code, everything else
    /// with a server-error code.
    pub fn close_kind(&self) -> CloseKind {
        match self {
            SessionError::PayloadTooLarge { .. } => CloseKind::ClientError,
            _ => CloseKind::ServerError,
        }
    }
}
