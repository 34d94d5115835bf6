//! Event-stream transport: server-to-client push over SSE.
//!
//! One-directional and read-only. `connect()` issues the GET, checks the
//! status, and spawns a reader that splits the body on SSE frame boundaries
//! (`data: …\n\n`) and forwards each payload to subscribers. Tool invocation
//! is not supported on this transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Client as HttpClient;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::errors::BridgeError;
use crate::transport::http::{build_headers, classify_reqwest_error};

/// Buffered push messages per subscriber before old ones drop.
const PUSH_CHANNEL_CAPACITY: usize = 256;

// ─── EventStreamTransport ────────────────────────────────────────────────────

/// Push-only transport over a Server-Sent Events endpoint.
#[derive(Debug)]
pub struct EventStreamTransport {
    server: String,
    url: String,
    http: HttpClient,
    connect_timeout: Duration,
    events: broadcast::Sender<serde_json::Value>,
    connected: Arc<AtomicBool>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EventStreamTransport {
    /// Build the transport cold; `connect()` performs the handshake.
    pub fn new(config: &ServerConfig) -> Result<Self, BridgeError> {
        let name = config.name.clone();
        let url = config.url.clone().ok_or_else(|| BridgeError::Config {
            reason: format!("server '{name}': event-stream transport requires 'url'"),
        })?;

        let headers = build_headers(&name, &config.auth_headers)?;
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);

        let http = HttpClient::builder()
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| BridgeError::Config {
                reason: format!("server '{name}': failed to build HTTP client: {e}"),
            })?;

        let (events, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);

        Ok(Self {
            server: name,
            url,
            http,
            connect_timeout,
            events,
            connected: Arc::new(AtomicBool::new(false)),
            reader: std::sync::Mutex::new(None),
        })
    }

    /// Perform the handshake and start the background reader.
    pub async fn connect(&mut self) -> Result<(), BridgeError> {
        let response = self
            .http
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&self.server, self.connect_timeout, &e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BridgeError::Auth {
                server: self.server.clone(),
                detail: format!("HTTP {}", status.as_u16()),
            });
        }
        if !status.is_success() {
            return Err(BridgeError::Refused {
                server: self.server.clone(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }

        self.connected.store(true, Ordering::SeqCst);

        let server = self.server.clone();
        let events = self.events.clone();
        let connected = self.connected.clone();

        let handle = tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            loop {
                // Drain complete SSE frames already in the buffer
                while let Some(frame_end) = buffer.find("\n\n") {
                    let frame = buffer[..frame_end].to_string();
                    buffer = buffer[frame_end + 2..].to_string();
                    forward_frame(&server, &events, &frame);
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                    }
                    Some(Err(e)) => {
                        tracing::warn!(server = %server, error = %e, "event stream read error");
                        break;
                    }
                    None => {
                        tracing::debug!(server = %server, "event stream ended");
                        break;
                    }
                }
            }

            // Flush any trailing frame without a final blank line
            if !buffer.trim().is_empty() {
                forward_frame(&server, &events, buffer.trim());
            }
            connected.store(false, Ordering::SeqCst);
        });

        *self.reader.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Tool invocation is not supported on a push-only transport.
    pub async fn call(
        &self,
        _name: &str,
        _arguments: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        Err(BridgeError::PushOnly {
            server: self.server.clone(),
        })
    }

    /// Liveness probe: the reader task must still be consuming the stream.
    pub async fn probe(&self) -> Result<(), BridgeError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BridgeError::Closed {
                server: self.server.clone(),
                reason: Some("event stream ended".into()),
            })
        }
    }

    /// Receiver for pushed messages.
    pub fn subscribe(&self) -> broadcast::Receiver<serde_json::Value> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Parse the `data:` lines of one SSE frame and forward the payload.
///
/// JSON payloads are forwarded as parsed values; anything else is forwarded
/// as a JSON string so subscribers never lose a message to a format quirk.
fn forward_frame(server: &str, events: &broadcast::Sender<serde_json::Value>, frame: &str) {
    let mut data = String::new();
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data.push_str(rest.trim_start());
        }
        // Comment lines (":keep-alive") and event-type lines are ignored
    }

    if data.is_empty() {
        return;
    }

    let value = serde_json::from_str::<serde_json::Value>(&data)
        .unwrap_or_else(|_| serde_json::Value::String(data));

    tracing::trace!(server = %server, "event stream message");
    let _ = events.send(value);
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_config(url: &str) -> ServerConfig {
        ServerConfig::event_stream("feed", url)
    }

    #[test]
    fn test_new_requires_url() {
        let mut config = stream_config("https://x/events");
        config.url = None;
        assert!(matches!(
            EventStreamTransport::new(&config),
            Err(BridgeError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_call_is_push_only() {
        let transport = EventStreamTransport::new(&stream_config("https://x/events")).unwrap();
        let err = transport
            .call("store.save", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::PushOnly { .. }));
    }

    #[tokio::test]
    async fn test_probe_fails_before_connect() {
        let transport = EventStreamTransport::new(&stream_config("https://x/events")).unwrap();
        assert!(transport.probe().await.is_err());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused_against_closed_port() {
        let mut transport =
            EventStreamTransport::new(&stream_config("http://127.0.0.1:1/events")).unwrap();
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_retryable(), "expected retryable error, got {err:?}");
    }

    #[test]
    fn test_forward_frame_parses_json_payload() {
        let (tx, mut rx) = broadcast::channel(8);
        forward_frame("feed", &tx, "data: {\"kind\": \"note\"}");

        let value = rx.try_recv().unwrap();
        assert_eq!(value["kind"], "note");
    }

    #[test]
    fn test_forward_frame_passes_raw_text_through() {
        let (tx, mut rx) = broadcast::channel(8);
        forward_frame("feed", &tx, "data: plain text ping");

        let value = rx.try_recv().unwrap();
        assert_eq!(value, serde_json::Value::String("plain text ping".into()));
    }

    #[test]
    fn test_forward_frame_ignores_comments_and_empty() {
        let (tx, mut rx) = broadcast::channel(8);
        forward_frame("feed", &tx, ":keep-alive");
        forward_frame("feed", &tx, "event: update");
        assert!(rx.try_recv().is_err());
    }
}
