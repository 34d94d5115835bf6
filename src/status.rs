//! Connection status tracking and the status notification stream.
//!
//! [`ConnectionStatus`] is the mutable state attached to a registry entry;
//! only the supervisor and the health monitor transition it. Status changes
//! are published as [`StatusEvent`]s over a broadcast channel: fire-and-forget,
//! lossy for slow receivers, no acknowledgment.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// How many status events are buffered per subscriber before old ones drop.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ─── Connection State ────────────────────────────────────────────────────────

/// Connection lifecycle state of one registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

// ─── Connection Status ───────────────────────────────────────────────────────

/// Derived, mutable state for one server connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub server: String,
    pub state: ConnectionState,
    /// Timestamp of the last successful liveness check or connect.
    pub last_ping: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            state: ConnectionState::Disconnected,
            last_ping: None,
            latency_ms: None,
            last_error: None,
        }
    }

    pub(crate) fn mark_connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    pub(crate) fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.last_ping = Some(Utc::now());
        self.last_error = None;
    }

    pub(crate) fn mark_error(&mut self, message: &str) {
        self.state = ConnectionState::Error;
        self.last_error = Some(message.to_string());
    }

    pub(crate) fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.latency_ms = None;
    }

    /// Record a successful liveness probe.
    pub(crate) fn record_probe(&mut self, latency_ms: u64) {
        self.last_ping = Some(Utc::now());
        self.latency_ms = Some(latency_ms);
    }
}

// ─── Status Events ───────────────────────────────────────────────────────────

/// Status change notification consumed by external collaborators
/// (CLI status command, dashboard).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase", tag = "event")]
pub enum StatusEvent {
    Connected { server: String },
    Disconnected { server: String, reason: String },
    Error { server: String, message: String },
}

impl StatusEvent {
    pub fn server(&self) -> &str {
        match self {
            Self::Connected { server }
            | Self::Disconnected { server, .. }
            | Self::Error { server, .. } => server,
        }
    }
}

/// Publisher side of the status stream.
///
/// Cloning shares the underlying channel. `emit` never blocks and ignores
/// the absence of subscribers.
#[derive(Debug, Clone)]
pub struct StatusNotifier {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: StatusEvent) {
        tracing::debug!(server = event.server(), event = ?event, "status event");
        let _ = self.tx.send(event);
    }
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_status_is_disconnected() {
        let status = ConnectionStatus::new("local");
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.last_ping.is_none());
        assert!(status.last_error.is_none());
    }

    #[test]
    fn test_connect_transition_records_ping() {
        let mut status = ConnectionStatus::new("local");
        status.mark_connecting();
        assert_eq!(status.state, ConnectionState::Connecting);

        status.mark_connected();
        assert_eq!(status.state, ConnectionState::Connected);
        assert!(status.last_ping.is_some());
    }

    #[test]
    fn test_connected_clears_previous_error() {
        let mut status = ConnectionStatus::new("local");
        status.mark_error("connection refused");
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.last_error.is_some());

        status.mark_connecting();
        status.mark_connected();
        assert!(status.last_error.is_none());
    }

    #[test]
    fn test_probe_updates_latency() {
        let mut status = ConnectionStatus::new("local");
        status.mark_connected();
        status.record_probe(12);
        assert_eq!(status.latency_ms, Some(12));
    }

    #[tokio::test]
    async fn test_notifier_delivers_to_subscriber() {
        let notifier = StatusNotifier::new();
        let mut rx = notifier.subscribe();

        notifier.emit(StatusEvent::Connected {
            server: "local".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.server(), "local");
        assert!(matches!(event, StatusEvent::Connected { .. }));
    }

    #[test]
    fn test_emit_without_subscribers_is_fire_and_forget() {
        let notifier = StatusNotifier::new();
        // No receiver exists; emit must not panic or error
        notifier.emit(StatusEvent::Error {
            server: "local".into(),
            message: "probe failed".into(),
        });
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = StatusEvent::Disconnected {
            server: "local".into(),
            reason: "disconnected by caller".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "disconnected");
        assert_eq!(json["server"], "local");
    }
}
