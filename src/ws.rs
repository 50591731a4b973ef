use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::SharedState;
use crate::errors::CloseKind;
use crate::lsp::{ClientConnection, Outbound, SessionManager};

const PING_INTERVAL: Duration = Duration::from_secs(30);

const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity taken from the upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Handshake {
    principal: Option<String>,
    session_id: Option<String>,
}

/// `GET /lsp`: upgrade to a WebSocket bound to the caller's workspace.
pub async fn lsp_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Response {
    if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok())
        && !origin_allowed(origin, &state.config.allowed_origins)
    {
        warn!(origin, "LSP websocket origin rejected");
        return StatusCode::FORBIDDEN.into_response();
    }

    let handshake = Handshake {
        principal: header_value(&headers, &state.config.principal_header),
        session_id: cookie_value(&headers, &state.config.session_cookie),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, handshake))
}

async fn handle_socket(socket: WebSocket, state: SharedState, handshake: Handshake) {
    let started = std::time::Instant::now();
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (mut sender, receiver) = socket.split();

    if !state.pool.is_enabled() {
        debug!(connection_id = %connection_id, reason = "disabled", "LSP websocket connect rejected");
        close_with(&mut sender, close_code::POLICY, "LSP disabled").await;
        return;
    }

    let Some(principal) = handshake.principal else {
        debug!(connection_id = %connection_id, reason = "unauthenticated", "LSP websocket connect rejected");
        close_with(&mut sender, close_code::UNSUPPORTED, "Authentication required").await;
        return;
    };

    let (connection, outbound) = ClientConnection::new(&connection_id, Some(principal), handshake.session_id);
    if let Err(e) = state.sessions.open(connection).await {
        warn!(
            connection_id = %connection_id,
            duration_ms = started.elapsed().as_millis() as u64,
            error = %e,
            "Failed to establish LSP bridge"
        );
        close_with(&mut sender, close_code::ERROR, "LSP backend unavailable").await;
        return;
    }
    debug!(
        connection_id = %connection_id,
        duration_ms = started.elapsed().as_millis() as u64,
        "LSP websocket connect established"
    );

    run_socket_loop(sender, receiver, outbound, &state.sessions, &connection_id).await;
    state.sessions.close(&connection_id).await;
}

/// Pump frames between one WebSocket and its bridge, with ping/pong keepalive.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    sessions: &SessionManager,
    connection_id: &str,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Vec::<u8>::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Backend → client ────────────────────────────────────
            frame = outbound.recv() => {
                match frame {
                    Some(Outbound::Text(text)) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close(kind)) => {
                        let (code, reason) = close_frame_for(kind);
                        close_with(&mut sender, code, reason).await;
                        break;
                    }
                    None => break,
                }
            }

            // ── Client → backend ────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = sessions.forward_client_message(connection_id, text.as_str()).await {
                            warn!(connection_id, error = %e, "LSP message forwarding failed");
                            let (code, reason) = close_frame_for(e.close_kind());
                            close_with(&mut sender, code, reason).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(connection_id, error = %e, "LSP websocket transport error");
                        break;
                    }
                }
            }
        }
    }
}

async fn close_with(sender: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}

fn close_frame_for(kind: CloseKind) -> (u16, &'static str) {
    match kind {
        CloseKind::ClientError => (close_code::INVALID, "Invalid or oversized LSP payload"),
        CloseKind::ServerError => (close_code::ERROR, "LSP backend unavailable"),
    }
}

/// Match an `Origin` against allowlist patterns. A pattern ending in `:*`
/// accepts any numeric port, and also the bare host.
pub fn origin_allowed(origin: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| origin_matches(origin, pattern))
}

fn origin_matches(origin: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let Some(base) = pattern.strip_suffix(":*") else {
        return origin.eq_ignore_ascii_case(pattern);
    };
    let Some(rest) = origin
        .get(..base.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(base))
        .map(|_| &origin[base.len()..])
    else {
        return false;
    };
    match rest.strip_prefix(':') {
        Some(port) => !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()),
        None => rest.is_empty(),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn patterns() -> Vec<String> {
        vec![
            "http://localhost:*".to_string(),
            "https://app.example.com".to_string(),
        ]
    }

    #[test]
    fn test_origin_port_wildcard() {
        assert!(origin_allowed("http://localhost:5173", &patterns()));
        assert!(origin_allowed("http://localhost", &patterns()));
        assert!(!origin_allowed("http://localhost:abc", &patterns()));
        assert!(!origin_allowed("http://localhost.evil.com", &patterns()));
        assert!(!origin_allowed("https://localhost:5173", &patterns()));
    }

    #[test]
    fn test_origin_exact_match() {
        assert!(origin_allowed("https://app.example.com", &patterns()));
        assert!(origin_allowed("HTTPS://APP.EXAMPLE.COM", &patterns()));
        assert!(!origin_allowed("https://app.example.com:8443", &patterns()));
        assert!(!origin_allowed("https://evil.com", &patterns()));
    }

    #[test]
    fn test_origin_any() {
        assert!(origin_allowed("https://anything", &["*".to_string()]));
        assert!(!origin_allowed("https://anything", &[]));
    }

    #[test]
    fn test_session_cookie_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; SESSION=http-1 ; x=y"));
        assert_eq!(cookie_value(&headers, "SESSION").as_deref(), Some("http-1"));
        assert_eq!(cookie_value(&headers, "MISSING"), None);
    }

    #[test]
    fn test_session_cookie_across_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::COOKIE, HeaderValue::from_static("SESSION=abc"));
        assert_eq!(cookie_value(&headers, "SESSION").as_deref(), Some("abc"));
    }

    #[test]
    fn test_principal_header_blank_is_missing() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-user", HeaderValue::from_static("alice"));
        assert_eq!(header_value(&headers, "x-forwarded-user").as_deref(), Some("alice"));

        headers.insert("x-forwarded-user", HeaderValue::from_static("  "));
        assert_eq!(header_value(&headers, "x-forwarded-user"), None);
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(close_frame_for(CloseKind::ClientError).0, 1007);
        assert_eq!(close_frame_for(CloseKind::ServerError).0, 1011);
    }
}
