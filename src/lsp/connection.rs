//! Client connection handles and the fan-out set a bridge broadcasts to.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::mpsc;

use crate::errors::CloseKind;

/// A frame queued for one client connection's socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close(CloseKind),
}

/// The gateway's handle to one client connection.
///
/// The socket task owns the receiving half; once it goes away every send
/// fails, which is how a bridge notices a dead subscriber.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    pub id: String,
    pub principal: Option<String>,
    pub session_id: Option<String>,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl ClientConnection {
    pub fn new(
        id: impl Into<String>,
        principal: Option<String>,
        session_id: Option<String>,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection = Self {
            id: id.into(),
            principal,
            session_id,
            sender,
        };
        (connection, receiver)
    }

    /// Queue a text frame. Returns false if the connection is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.sender.send(Outbound::Text(text)).is_ok()
    }

    /// Ask the socket task to close the connection.
    pub fn close(&self, kind: CloseKind) {
        let _ = self.sender.send(Outbound::Close(kind));
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

struct ConnectionSetState {
    connections: HashMap<String, ClientConnection>,
    last_attached: Instant,
}

/// Thread-safe set of attached connections with partial-failure broadcast.
pub struct ConnectionSet {
    state: Mutex<ConnectionSetState>,
}

impl Default for ConnectionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionSetState {
                connections: HashMap::new(),
                last_attached: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionSetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attach(&self, connection: ClientConnection) {
        let mut state = self.lock();
        state.connections.insert(connection.id.clone(), connection);
        state.last_attached = Instant::now();
    }

    pub fn detach(&self, connection_id: &str) {
        let mut state = self.lock();
        state.connections.remove(connection_id);
        if state.connections.is_empty() {
            state.last_attached = Instant::now();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_attached(&self) -> Instant {
        self.lock().last_attached
    }

    /// Deliver `message` to every attached connection, detaching the ones
    /// that can no longer receive. Returns the number of successful deliveries.
    pub fn broadcast(&self, message: &str) -> usize {
        let mut state = self.lock();
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, connection) in &state.connections {
            if connection.send_text(message.to_string()) {
                delivered += 1;
            } else {
                failed.push(id.clone());
            }
        }
        for id in failed {
            tracing::debug!(connection_id = %id, "LSP bridge failed to send, detaching");
            state.connections.remove(&id);
        }
        if state.connections.is_empty() && delivered == 0 {
            state.last_attached = Instant::now();
        }
        delivered
    }

    /// Close and drop every attached connection.
    pub fn close_all(&self, kind: CloseKind) {
        let mut state = self.lock();
        for (_, connection) in state.connections.drain() {
            if connection.is_open() {
                connection.close(kind);
            }
        }
        state.last_attached = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_fails_after_receiver_dropped() {
        let (conn, rx) = ClientConnection::new("ws-1", None, None);
        assert!(conn.is_open());
        assert!(conn.send_text("hello".into()));
        drop(rx);
        assert!(!conn.is_open());
        assert!(!conn.send_text("hello".into()));
    }

    #[test]
    fn test_broadcast_reaches_all_in_order() {
        let set = ConnectionSet::new();
        let (a, mut rx_a) = ClientConnection::new("a", None, None);
        let (b, mut rx_b) = ClientConnection::new("b", None, None);
        set.attach(a);
        set.attach(b);

        assert_eq!(set.broadcast("one"), 2);
        assert_eq!(set.broadcast("two"), 2);

        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(rx.try_recv().unwrap(), Outbound::Text("one".into()));
            assert_eq!(rx.try_recv().unwrap(), Outbound::Text("two".into()));
        }
    }

    #[test]
    fn test_broadcast_detaches_only_failing_connection() {
        let set = ConnectionSet::new();
        let (a, rx_a) = ClientConnection::new("a", None, None);
        let (b, mut rx_b) = ClientConnection::new("b", None, None);
        set.attach(a);
        set.attach(b);
        drop(rx_a);

        assert_eq!(set.broadcast("msg"), 1);
        assert_eq!(set.len(), 1);
        assert_eq!(rx_b.try_recv().unwrap(), Outbound::Text("msg".into()));
    }

    #[test]
    fn test_detach_refreshes_last_attached_when_empty() {
        let set = ConnectionSet::new();
        let (a, _rx) = ClientConnection::new("a", None, None);
        set.attach(a);
        let attached_at = set.last_attached();
        std::thread::sleep(std::time::Duration::from_millis(2));
        set.detach("a");
        assert!(set.is_empty());
        assert!(set.last_attached() > attached_at);
    }

    #[test]
    fn test_close_all_sends_close_frame() {
        let set = ConnectionSet::new();
        let (a, mut rx) = ClientConnection::new("a", None, None);
        set.attach(a);
        set.close_all(CloseKind::ServerError);
        assert!(set.is_empty());
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close(CloseKind::ServerError));
    }
}
