//! Socket transport: persistent bidirectional WebSocket.
//!
//! Built cold; `connect()` performs the upgrade handshake with the resolved
//! auth headers attached. A background reader correlates responses to
//! in-flight calls by `id` and forwards server-initiated push messages to
//! subscribers. When the socket drops, every in-flight call fails with a
//! "connection closed" error instead of hanging.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::ServerConfig;
use crate::errors::BridgeError;
use crate::protocol::{self, ToolRequest, ToolResponse};

/// Buffered push messages per subscriber before old ones drop.
const PUSH_CHANNEL_CAPACITY: usize = 256;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type PendingMap = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<ToolResponse>>>>;

// ─── SocketTransport ─────────────────────────────────────────────────────────

/// Persistent WebSocket transport with server push support.
#[derive(Debug)]
pub struct SocketTransport {
    server: String,
    url: String,
    auth_headers: HashMap<String, String>,
    writer: Arc<Mutex<Option<WsSink>>>,
    pending: PendingMap,
    push: broadcast::Sender<serde_json::Value>,
    connected: Arc<AtomicBool>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SocketTransport {
    /// Build the transport cold; `connect()` performs the handshake.
    pub fn new(config: &ServerConfig) -> Result<Self, BridgeError> {
        let name = config.name.clone();
        let url = config.url.clone().ok_or_else(|| BridgeError::Config {
            reason: format!("server '{name}': socket transport requires 'url'"),
        })?;

        let (push, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);

        Ok(Self {
            server: name,
            url,
            auth_headers: config.auth_headers.clone(),
            writer: Arc::new(Mutex::new(None)),
            pending: Arc::new(std::sync::Mutex::new(HashMap::new())),
            push,
            connected: Arc::new(AtomicBool::new(false)),
            reader: std::sync::Mutex::new(None),
        })
    }

    /// Perform the upgrade handshake and start the background reader.
    pub async fn connect(&mut self) -> Result<(), BridgeError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| BridgeError::Config {
                reason: format!("server '{}': invalid socket url: {e}", self.server),
            })?;

        for (key, value) in &self.auth_headers {
            let header_name =
                HeaderName::from_bytes(key.as_bytes()).map_err(|e| BridgeError::Config {
                    reason: format!("server '{}': invalid auth header name '{key}': {e}", self.server),
                })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| BridgeError::Config {
                reason: format!("server '{}': invalid auth header value for '{key}': {e}", self.server),
            })?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| classify_ws_error(&self.server, e))?;

        let (sink, mut stream) = ws.split();
        *self.writer.lock().await = Some(sink);
        self.connected.store(true, Ordering::SeqCst);

        let server = self.server.clone();
        let writer = self.writer.clone();
        let pending = self.pending.clone();
        let push = self.push.clone();
        let connected = self.connected.clone();

        let handle = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        dispatch_text(&server, &pending, &push, &text);
                    }
                    Ok(Message::Ping(payload)) => {
                        let mut writer = writer.lock().await;
                        if let Some(sink) = writer.as_mut() {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(server = %server, ?frame, "socket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(server = %server, error = %e, "socket read error");
                        break;
                    }
                }
            }

            connected.store(false, Ordering::SeqCst);
            // Dropping the senders fails every in-flight call with Closed
            pending.lock().unwrap().clear();
        });

        *self.reader.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Send a request and await the correlated response.
    pub async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(self.closed("socket is not connected"));
        }

        let id = protocol::next_request_id();
        let request = ToolRequest {
            id: Some(id),
            name: name.to_string(),
            arguments,
        };

        let text = serde_json::to_string(&request).map_err(|e| BridgeError::Protocol {
            server: self.server.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let write_result = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(sink) => sink.send(Message::Text(text)).await,
                None => {
                    self.pending.lock().unwrap().remove(&id);
                    return Err(self.closed("socket is not connected"));
                }
            }
        };

        if let Err(e) = write_result {
            self.pending.lock().unwrap().remove(&id);
            return Err(self.closed(&format!("failed to send frame: {e}")));
        }

        let response = rx
            .await
            .map_err(|_| self.closed("connection closed while awaiting response"))?;

        protocol::extract_result(&self.server, response)
    }

    /// Cheapest liveness probe: a ping frame.
    pub async fn probe(&self) -> Result<(), BridgeError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(self.closed("socket is not connected"));
        }

        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => sink
                .send(Message::Ping(Vec::new()))
                .await
                .map_err(|e| self.closed(&format!("ping failed: {e}"))),
            None => Err(self.closed("socket is not connected")),
        }
    }

    /// Receiver for server-initiated push messages.
    pub fn push_events(&self) -> broadcast::Receiver<serde_json::Value> {
        self.push.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Close the socket: best-effort close frame, stop the reader, fail any
    /// in-flight calls.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);

        {
            let mut writer = self.writer.lock().await;
            if let Some(sink) = writer.as_mut() {
                let _ = sink.send(Message::Close(None)).await;
            }
            *writer = None;
        }

        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
        self.pending.lock().unwrap().clear();
    }

    fn closed(&self, reason: &str) -> BridgeError {
        BridgeError::Closed {
            server: self.server.clone(),
            reason: Some(reason.to_string()),
        }
    }
}

/// Route one text frame: correlated response or server-initiated push.
fn dispatch_text(
    server: &str,
    pending: &PendingMap,
    push: &broadcast::Sender<serde_json::Value>,
    text: &str,
) {
    if let Ok(response) = serde_json::from_str::<ToolResponse>(text) {
        if let Some(id) = response.id {
            if let Some(tx) = pending.lock().unwrap().remove(&id) {
                let _ = tx.send(response);
                return;
            }
            tracing::debug!(server = %server, id, "response for unknown request id");
            return;
        }
    }

    let value = serde_json::from_str::<serde_json::Value>(text)
        .unwrap_or_else(|_| serde_json::Value::String(text.to_string()));
    let _ = push.send(value);
}

/// Map a tungstenite handshake/stream error to the taxonomy.
fn classify_ws_error(server: &str, e: tungstenite::Error) -> BridgeError {
    use tungstenite::Error as WsError;

    match e {
        WsError::Http(response) => {
            let status = response.status();
            if status == tungstenite::http::StatusCode::UNAUTHORIZED
                || status == tungstenite::http::StatusCode::FORBIDDEN
            {
                BridgeError::Auth {
                    server: server.to_string(),
                    detail: format!("HTTP {}", status.as_u16()),
                }
            } else {
                BridgeError::Refused {
                    server: server.to_string(),
                    reason: format!("handshake rejected with HTTP {}", status.as_u16()),
                }
            }
        }
        WsError::Tls(e) => BridgeError::Tls {
            server: server.to_string(),
            reason: e.to_string(),
        },
        WsError::Io(e) => BridgeError::Refused {
            server: server.to_string(),
            reason: e.to_string(),
        },
        WsError::Url(e) => BridgeError::Config {
            reason: format!("server '{server}': {e}"),
        },
        WsError::ConnectionClosed | WsError::AlreadyClosed => BridgeError::Closed {
            server: server.to_string(),
            reason: None,
        },
        other => BridgeError::Protocol {
            server: server.to_string(),
            reason: other.to_string(),
        },
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_config(url: &str) -> ServerConfig {
        ServerConfig::socket("sock", url)
    }

    #[tokio::test]
    async fn test_call_before_connect_fails_closed() {
        let transport = SocketTransport::new(&socket_config("ws://127.0.0.1:1/ws")).unwrap();
        let err = transport
            .call("store.save", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Closed { .. }));
    }

    #[tokio::test]
    async fn test_probe_before_connect_fails_closed() {
        let transport = SocketTransport::new(&socket_config("ws://127.0.0.1:1/ws")).unwrap();
        assert!(transport.probe().await.is_err());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused_against_closed_port() {
        let mut transport = SocketTransport::new(&socket_config("ws://127.0.0.1:1/ws")).unwrap();
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_retryable(), "expected retryable error, got {err:?}");
    }

    #[tokio::test]
    async fn test_connect_invalid_url_is_config_error() {
        let mut transport = SocketTransport::new(&socket_config("not a url")).unwrap();
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));
    }

    #[test]
    fn test_classify_handshake_401_as_auth() {
        let response = tungstenite::http::Response::builder()
            .status(401)
            .body(None)
            .unwrap();
        let err = classify_ws_error("sock", tungstenite::Error::Http(response));
        assert!(err.is_auth());
    }

    #[test]
    fn test_classify_handshake_500_as_refused() {
        let response = tungstenite::http::Response::builder()
            .status(500)
            .body(None)
            .unwrap();
        let err = classify_ws_error("sock", tungstenite::Error::Http(response));
        assert!(matches!(err, BridgeError::Refused { .. }));
    }

    #[test]
    fn test_dispatch_routes_correlated_response() {
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (push, mut push_rx) = broadcast::channel(8);
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(7, tx);

        dispatch_text("sock", &pending, &push, r#"{"id": 7, "result": "ok"}"#);

        let response = rx.try_recv().unwrap();
        assert_eq!(response.result, Some(serde_json::json!("ok")));
        assert!(push_rx.try_recv().is_err());
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dispatch_routes_push_message() {
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (push, mut push_rx) = broadcast::channel(8);

        dispatch_text("sock", &pending, &push, r#"{"kind": "notice", "body": "hi"}"#);

        let value = push_rx.try_recv().unwrap();
        assert_eq!(value["kind"], "notice");
    }
}
