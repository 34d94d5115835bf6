//! Connection supervisor: the retry/backoff state machine for one server.
//!
//! Owns the `disconnected → connecting → connected` transitions and the
//! backoff law between attempts. Authentication failures stop after exactly
//! one attempt; retryable failures consume attempts until the budget is
//! exhausted, at which point the entry lands in `error` with the attempt
//! count in the message. Backoff waits are ordinary cancellable sleeps.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::TransportKind;
use crate::errors::BridgeError;
use crate::registry::ServerEntry;
use crate::status::{StatusEvent, StatusNotifier};
use crate::transport::{ServerTransport, TransportFactory};

// ─── Backoff ─────────────────────────────────────────────────────────────────

/// Exponential backoff with a cap and ±25% uniform jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub cap_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            cap_delay: Duration::from_millis(10_000),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), cap)`, jittered uniformly into
    /// `[0.75 * delay, 1.25 * delay]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let cap = self.cap_delay.as_millis() as f64;
        let exp = base * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(cap);

        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((capped * jitter) as u64)
    }
}

// ─── ConnectionSupervisor ────────────────────────────────────────────────────

/// Establishes and re-establishes one named connection.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    notifier: StatusNotifier,
    backoff: BackoffPolicy,
}

impl ConnectionSupervisor {
    pub fn new(notifier: StatusNotifier, backoff: BackoffPolicy) -> Self {
        Self { notifier, backoff }
    }

    /// Establish the connection for an entry, driving its state machine.
    ///
    /// On success the transport is installed into the entry and a
    /// `Connected` event is emitted; starting the health monitor is the
    /// caller's job. On terminal failure the entry is in `error` and an
    /// `Error` event has been emitted.
    pub async fn establish(&self, entry: &ServerEntry) -> Result<Arc<ServerTransport>, BridgeError> {
        let max_attempts = entry.config.max_connect_retries + 1;
        self.run_attempts(entry, max_attempts, &self.backoff).await
    }

    /// Re-establish after a drop: close whatever transport is left, then run
    /// the same contract as an initial connection. Sockets use their
    /// configured reconnect policy for the attempt budget and backoff base.
    pub async fn reconnect(&self, entry: &ServerEntry) -> Result<Arc<ServerTransport>, BridgeError> {
        if let Some(old) = entry.take_transport().await {
            old.close().await;
        }

        if entry.config.kind == TransportKind::Socket {
            let policy = &entry.config.reconnect;
            let backoff = BackoffPolicy {
                base_delay: Duration::from_millis(policy.base_delay_ms),
                ..self.backoff.clone()
            };
            self.run_attempts(entry, policy.max_attempts + 1, &backoff).await
        } else {
            self.establish(entry).await
        }
    }

    async fn run_attempts(
        &self,
        entry: &ServerEntry,
        max_attempts: u32,
        backoff: &BackoffPolicy,
    ) -> Result<Arc<ServerTransport>, BridgeError> {
        let config = &entry.config;
        entry.mark_connecting();

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            match self.attempt_once(entry).await {
                Ok(transport) => {
                    let transport = Arc::new(transport);
                    entry.install_transport(transport.clone()).await;
                    entry.mark_connected();
                    tracing::info!(server = %config.name, attempt, "server connected");
                    self.notifier.emit(StatusEvent::Connected {
                        server: config.name.to_string(),
                    });
                    return Ok(transport);
                }
                Err(e) if !e.is_retryable() => {
                    // Auth and config failures get exactly one attempt
                    tracing::warn!(server = %config.name, error = %e, "connect failed, not retrying");
                    entry.mark_error(&e.to_string());
                    self.notifier.emit(StatusEvent::Error {
                        server: config.name.to_string(),
                        message: e.to_string(),
                    });
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    let exhausted = BridgeError::AttemptsExhausted {
                        server: config.name.to_string(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    };
                    tracing::warn!(
                        server = %config.name,
                        attempts = attempt,
                        error = %e,
                        "connect attempts exhausted"
                    );
                    entry.mark_error(&exhausted.to_string());
                    self.notifier.emit(StatusEvent::Error {
                        server: config.name.to_string(),
                        message: exhausted.to_string(),
                    });
                    return Err(exhausted);
                }
                Err(e) => {
                    let delay = backoff.delay_for_attempt(attempt);
                    tracing::debug!(
                        server = %config.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "connect attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One bounded connect attempt: build, handshake, all raced against the
    /// connect timeout. A timeout is an ordinary failed attempt.
    async fn attempt_once(&self, entry: &ServerEntry) -> Result<ServerTransport, BridgeError> {
        let config = &entry.config;
        let timeout = Duration::from_millis(config.connect_timeout_ms);

        let connect = async {
            let mut transport = TransportFactory::build(config)?;
            transport.connect().await?;
            Ok(transport)
        };

        match tokio::time::timeout(timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout {
                server: config.name.to_string(),
                timeout_ms: config.connect_timeout_ms,
            }),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::status::ConnectionState;

    #[test]
    fn test_backoff_within_jitter_bounds() {
        let policy = BackoffPolicy::default();
        for attempt in 1..=4u32 {
            let expected = (1_000f64 * 2f64.powi(attempt as i32 - 1)).min(10_000f64);
            let lower = (expected * 0.75) as u128;
            let upper = (expected * 1.25) as u128;

            for _ in 0..50 {
                let delay = policy.delay_for_attempt(attempt).as_millis();
                assert!(
                    delay >= lower && delay <= upper,
                    "attempt {attempt}: {delay}ms outside [{lower}, {upper}]"
                );
            }
        }
    }

    #[test]
    fn test_backoff_caps_at_max_delay() {
        let policy = BackoffPolicy::default();
        // 2^9 seconds would be far over the cap; jitter tops out at 1.25x
        let delay = policy.delay_for_attempt(10).as_millis();
        assert!(delay <= 12_500);
    }

    fn fast_supervisor() -> (ConnectionSupervisor, StatusNotifier) {
        let notifier = StatusNotifier::new();
        let backoff = BackoffPolicy {
            base_delay: Duration::from_millis(1),
            cap_delay: Duration::from_millis(2),
        };
        (ConnectionSupervisor::new(notifier.clone(), backoff), notifier)
    }

    #[tokio::test]
    async fn test_pipe_connects_on_first_attempt() {
        let (supervisor, notifier) = fast_supervisor();
        let mut rx = notifier.subscribe();

        let entry = ServerEntry::new(ServerConfig::process_pipe("local", "cat", vec![]));
        let transport = supervisor.establish(&entry).await.unwrap();

        assert_eq!(entry.state(), ConnectionState::Connected);
        assert!(entry.status().last_ping.is_some());
        assert!(matches!(rx.recv().await.unwrap(), StatusEvent::Connected { .. }));
        transport.close().await;
    }

    #[tokio::test]
    async fn test_persistent_failure_makes_exactly_four_attempts() {
        let (supervisor, _notifier) = fast_supervisor();

        // Spawn fails every time: the binary does not exist. Spawn errors
        // are retryable, so the full budget is consumed.
        let config =
            ServerConfig::process_pipe("local", "definitely-not-a-real-binary-4711", vec![])
                .with_max_connect_retries(3);
        let entry = ServerEntry::new(config);

        let err = supervisor.establish(&entry).await.unwrap_err();
        match err {
            BridgeError::AttemptsExhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected AttemptsExhausted, got {other:?}"),
        }
        assert_eq!(entry.state(), ConnectionState::Error);
        assert!(entry.status().last_error.unwrap().contains("4 attempts"));
    }

    #[tokio::test]
    async fn test_config_failure_stops_after_one_attempt() {
        let (supervisor, notifier) = fast_supervisor();
        let mut rx = notifier.subscribe();

        // Missing command is a non-retryable config error
        let mut config = ServerConfig::process_pipe("local", "cat", vec![]);
        config.command = None;
        let entry = ServerEntry::new(config);

        let err = supervisor.establish(&entry).await.unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));
        assert_eq!(entry.state(), ConnectionState::Error);
        assert!(matches!(rx.recv().await.unwrap(), StatusEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_socket_timeout_counts_as_failed_attempt() {
        let (supervisor, _notifier) = fast_supervisor();

        // A listener that accepts but never answers the upgrade: every
        // handshake hangs until the 50ms budget trips.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stall = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let config = ServerConfig::socket("sock", &format!("ws://{addr}/ws"))
            .with_connect_timeout_ms(50)
            .with_max_connect_retries(1);
        let entry = ServerEntry::new(config);

        let err = supervisor.establish(&entry).await.unwrap_err();
        match err {
            BridgeError::AttemptsExhausted {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("timed out"));
            }
            other => panic!("expected AttemptsExhausted, got {other:?}"),
        }
        stall.abort();
    }

    #[tokio::test]
    async fn test_event_stream_attach_failure_keeps_server_connected() {
        let (supervisor, notifier) = fast_supervisor();
        let mut rx = notifier.subscribe();

        // Request-reply construction does no I/O; the dead events endpoint
        // only affects the supplementary channel, which is non-fatal
        let config = ServerConfig::request_reply("remote", "http://127.0.0.1:1/tools")
            .with_events_url("http://127.0.0.1:1/events");
        let entry = ServerEntry::new(config);

        supervisor.establish(&entry).await.unwrap();
        assert_eq!(entry.state(), ConnectionState::Connected);
        assert!(matches!(
            rx.recv().await.unwrap(),
            StatusEvent::Connected { .. }
        ));
    }

    #[tokio::test]
    async fn test_auth_rejection_stops_after_one_attempt() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (supervisor, _notifier) = fast_supervisor();

        // A listener that rejects every upgrade with HTTP 401
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let attempts_seen = Arc::new(AtomicU32::new(0));
        let counter = attempts_seen.clone();
        let server = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\n\r\n")
                    .await;
            }
        });

        let config =
            ServerConfig::socket("sock", &format!("ws://{addr}/ws")).with_max_connect_retries(5);
        let entry = ServerEntry::new(config);

        let err = supervisor.establish(&entry).await.unwrap_err();
        assert!(err.is_auth());
        assert!(err.to_string().contains("credentials"));
        // One attempt despite the budget of 5 retries
        assert_eq!(attempts_seen.load(Ordering::SeqCst), 1);
        assert_eq!(entry.state(), ConnectionState::Error);
        server.abort();
    }

    #[tokio::test]
    async fn test_socket_reconnect_uses_reconnect_policy_budget() {
        let (supervisor, _notifier) = fast_supervisor();

        let mut config = ServerConfig::socket("sock", "ws://127.0.0.1:1/ws")
            .with_connect_timeout_ms(200)
            .with_max_connect_retries(5);
        config.reconnect.max_attempts = 1;
        config.reconnect.base_delay_ms = 1;
        let entry = ServerEntry::new(config);

        let err = supervisor.reconnect(&entry).await.unwrap_err();
        match err {
            // 1 initial + 1 retry from the reconnect policy, not 6
            BridgeError::AttemptsExhausted { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected AttemptsExhausted, got {other:?}"),
        }
    }
}
