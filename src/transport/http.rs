//! Request-reply transport: one HTTP POST per message.
//!
//! The client is built once at construction with the content-type and auth
//! headers installed as defaults, so individual calls carry no per-request
//! auth logic. HTTP 401/403 map to the auth error; connect, timeout, and
//! certificate failures map to their distinct variants for operator diagnosis.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client as HttpClient;

use crate::config::ServerConfig;
use crate::errors::BridgeError;
use crate::protocol::{self, ToolRequest, ToolResponse};
use crate::transport::sse::EventStreamTransport;

/// Total request timeout for one POST.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ─── HttpTransport ───────────────────────────────────────────────────────────

/// Synchronous request-reply transport over HTTP POST.
///
/// Connected on construction; there is no handshake. When the config names a
/// supplementary `events_url`, an event-stream channel is attached during
/// `connect()`; its failure is a warning, never a connect failure.
#[derive(Debug)]
pub struct HttpTransport {
    server: String,
    url: String,
    http: HttpClient,
    events: Option<EventStreamTransport>,
    events_config: Option<ServerConfig>,
}

impl HttpTransport {
    pub fn new(config: &ServerConfig) -> Result<Self, BridgeError> {
        let name = config.name.clone();
        let url = config.url.clone().ok_or_else(|| BridgeError::Config {
            reason: format!("server '{name}': request-reply transport requires 'url'"),
        })?;

        let headers = build_headers(&name, &config.auth_headers)?;
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);

        let http = HttpClient::builder()
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::Config {
                reason: format!("server '{name}': failed to build HTTP client: {e}"),
            })?;

        // The supplementary event-stream channel is built from a derived
        // config so it reuses the same auth headers and timeouts.
        let events_config = config.events_url.as_ref().map(|events_url| {
            let mut derived = config.clone();
            derived.kind = crate::config::TransportKind::EventStream;
            derived.url = Some(events_url.clone());
            derived.events_url = None;
            derived
        });

        Ok(Self {
            server: name,
            url,
            http,
            events: None,
            events_config,
        })
    }

    /// Attach the supplementary event-stream channel, if configured.
    ///
    /// A failed attach is logged as a warning and swallowed: the primary
    /// request-reply channel is already usable, and the stream is only a
    /// notification side channel.
    pub async fn connect(&mut self) -> Result<(), BridgeError> {
        let Some(events_config) = &self.events_config else {
            return Ok(());
        };

        let mut stream = EventStreamTransport::new(events_config)?;
        match stream.connect().await {
            Ok(()) => {
                tracing::info!(server = %self.server, "supplementary event stream attached");
                self.events = Some(stream);
            }
            Err(e) => {
                tracing::warn!(
                    server = %self.server,
                    error = %e,
                    "supplementary event stream failed to attach; continuing without it"
                );
            }
        }
        Ok(())
    }

    /// Send one tool invocation as an HTTP POST.
    pub async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        let request = ToolRequest::new(name, arguments);

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&self.server, REQUEST_TIMEOUT, &e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BridgeError::Auth {
                server: self.server.clone(),
                detail: format!("HTTP {}", status.as_u16()),
            });
        }
        if status.is_server_error() {
            return Err(BridgeError::Refused {
                server: self.server.clone(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }
        if !status.is_success() {
            return Err(BridgeError::Protocol {
                server: self.server.clone(),
                reason: format!("unexpected HTTP {}", status.as_u16()),
            });
        }

        let body: ToolResponse = response.json().await.map_err(|e| BridgeError::Protocol {
            server: self.server.clone(),
            reason: format!("failed to parse response body: {e}"),
        })?;

        protocol::extract_result(&self.server, body)
    }

    /// Cheapest liveness probe: a list-tools invocation.
    pub async fn probe(&self) -> Result<(), BridgeError> {
        self.call(protocol::LIST_TOOLS, serde_json::json!({})).await?;
        Ok(())
    }

    /// Receiver for pushed messages from the supplementary event stream.
    pub fn push_events(&self) -> Option<tokio::sync::broadcast::Receiver<serde_json::Value>> {
        self.events.as_ref().map(|s| s.subscribe())
    }

    pub async fn close(&self) {
        if let Some(events) = &self.events {
            events.close().await;
        }
        // The HTTP client itself holds no connection state worth tearing
        // down beyond its keep-alive pool, which drops with the client.
    }
}

// ─── Error Classification ────────────────────────────────────────────────────

/// Build the default header map: JSON content type plus resolved auth headers.
pub(crate) fn build_headers(
    server: &str,
    auth_headers: &std::collections::HashMap<String, String>,
) -> Result<HeaderMap, BridgeError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    for (key, value) in auth_headers {
        let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| BridgeError::Config {
            reason: format!("server '{server}': invalid auth header name '{key}': {e}"),
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| BridgeError::Config {
            reason: format!("server '{server}': invalid auth header value for '{key}': {e}"),
        })?;
        headers.insert(header_name, header_value);
    }

    Ok(headers)
}

/// Map a reqwest error to the taxonomy: timeout, TLS, or refused.
pub(crate) fn classify_reqwest_error(
    server: &str,
    timeout: Duration,
    e: &reqwest::Error,
) -> BridgeError {
    if e.is_timeout() {
        return BridgeError::Timeout {
            server: server.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
    }

    // reqwest wraps rustls/webpki failures; the error chain text is the only
    // portable signal for certificate problems.
    let text = format!("{e:?}").to_lowercase();
    if text.contains("certificate") || text.contains("tls") || text.contains("handshake") {
        return BridgeError::Tls {
            server: server.to_string(),
            reason: e.to_string(),
        };
    }

    BridgeError::Refused {
        server: server.to_string(),
        reason: e.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
