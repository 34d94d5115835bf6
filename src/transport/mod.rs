//! Transport layer: the four concrete I/O mechanisms behind one dispatch table.
//!
//! [`TransportFactory::build`] turns a validated [`ServerConfig`] into the
//! matching [`ServerTransport`] variant. Process-pipe and request-reply
//! transports are connected on construction; socket and event-stream are
//! built cold and handshake in `connect()`.

pub mod http;
pub mod pipe;
pub mod socket;
pub mod sse;

use tokio::sync::broadcast;

use crate::config::{ServerConfig, TransportKind};
use crate::errors::BridgeError;

pub use http::HttpTransport;
pub use pipe::PipeTransport;
pub use socket::SocketTransport;
pub use sse::EventStreamTransport;

// ─── ServerTransport ─────────────────────────────────────────────────────────

/// One live transport instance per registry entry.
///
/// Variant dispatch keeps the factory side-effect-free for kinds not in use
/// and makes the supported set explicit.
#[derive(Debug)]
pub enum ServerTransport {
    Pipe(PipeTransport),
    Http(HttpTransport),
    Socket(SocketTransport),
    EventStream(EventStreamTransport),
}

impl ServerTransport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Pipe(_) => TransportKind::ProcessPipe,
            Self::Http(_) => TransportKind::RequestReply,
            Self::Socket(_) => TransportKind::Socket,
            Self::EventStream(_) => TransportKind::EventStream,
        }
    }

    /// Perform the handshake for variants that need one. No-op for pipe;
    /// attaches the supplementary event stream for request-reply.
    pub async fn connect(&mut self) -> Result<(), BridgeError> {
        match self {
            Self::Pipe(_) => Ok(()),
            Self::Http(t) => t.connect().await,
            Self::Socket(t) => t.connect().await,
            Self::EventStream(t) => t.connect().await,
        }
    }

    /// Invoke a tool and wait for its result.
    pub async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        match self {
            Self::Pipe(t) => t.call(name, arguments).await,
            Self::Http(t) => t.call(name, arguments).await,
            Self::Socket(t) => t.call(name, arguments).await,
            Self::EventStream(t) => t.call(name, arguments).await,
        }
    }

    /// The variant's cheapest liveness check.
    pub async fn probe(&self) -> Result<(), BridgeError> {
        match self {
            Self::Pipe(t) => t.probe().await,
            Self::Http(t) => t.probe().await,
            Self::Socket(t) => t.probe().await,
            Self::EventStream(t) => t.probe().await,
        }
    }

    /// Release the underlying resources (process handle, socket, keep-alive).
    pub async fn close(&self) {
        match self {
            Self::Pipe(t) => t.close().await,
            Self::Http(t) => t.close().await,
            Self::Socket(t) => t.close().await,
            Self::EventStream(t) => t.close().await,
        }
    }

    /// Receiver for server-initiated push messages, where the variant has any.
    pub fn push_events(&self) -> Option<broadcast::Receiver<serde_json::Value>> {
        match self {
            Self::Pipe(_) => None,
            Self::Http(t) => t.push_events(),
            Self::Socket(t) => Some(t.push_events()),
            Self::EventStream(t) => Some(t.subscribe()),
        }
    }
}

// ─── TransportFactory ────────────────────────────────────────────────────────

/// Builds the correct transport variant for a server config.
pub struct TransportFactory;

impl TransportFactory {
    /// Build a transport for the config's kind.
    ///
    /// Fails with a config error when required fields for the kind are
    /// missing. Socket and event-stream transports come back cold; call
    /// [`ServerTransport::connect`] before use.
    pub fn build(config: &ServerConfig) -> Result<ServerTransport, BridgeError> {
        config.validate()?;

        let transport = match config.kind {
            TransportKind::ProcessPipe => ServerTransport::Pipe(PipeTransport::spawn(config)?),
            TransportKind::RequestReply => ServerTransport::Http(HttpTransport::new(config)?),
            TransportKind::Socket => ServerTransport::Socket(SocketTransport::new(config)?),
            TransportKind::EventStream => {
                ServerTransport::EventStream(EventStreamTransport::new(config)?)
            }
        };

        tracing::debug!(
            server = %config.name,
            kind = %config.kind,
            "built transport"
        );
        Ok(transport)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = ServerConfig::request_reply("remote", "https://x/tools");
        config.url = None;
        assert!(matches!(
            TransportFactory::build(&config),
            Err(BridgeError::Config { .. })
        ));
    }

    #[test]
    fn test_build_http_is_connected_synchronously() {
        let config = ServerConfig::request_reply("remote", "https://x/tools");
        let transport = TransportFactory::build(&config).unwrap();
        assert_eq!(transport.kind(), TransportKind::RequestReply);
    }

    #[test]
    fn test_build_socket_comes_back_cold() {
        let config = ServerConfig::socket("sock", "ws://127.0.0.1:9/ws");
        let transport = TransportFactory::build(&config).unwrap();
        assert_eq!(transport.kind(), TransportKind::Socket);
        match &transport {
            ServerTransport::Socket(t) => assert!(!t.is_connected()),
            _ => panic!("expected socket variant"),
        }
    }

    #[tokio::test]
    async fn test_build_pipe_spawns_process() {
        let config = ServerConfig::process_pipe("local", "cat", vec![]);
        let transport = TransportFactory::build(&config).unwrap();
        assert_eq!(transport.kind(), TransportKind::ProcessPipe);
        transport.close().await;
    }

    #[test]
    fn test_push_events_by_variant() {
        let stream = TransportFactory::build(&ServerConfig::event_stream(
            "feed",
            "https://x/events",
        ))
        .unwrap();
        assert!(stream.push_events().is_some());

        let http =
            TransportFactory::build(&ServerConfig::request_reply("remote", "https://x/tools"))
                .unwrap();
        // No supplementary stream configured, so no push channel
        assert!(http.push_events().is_none());
    }
}
