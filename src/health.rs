//! Health monitor: per-server liveness probing and reconnect triggering.
//!
//! One timer task per connected server. The first probe fires immediately so
//! a freshly connected server is validated before any caller-visible tool
//! call; after that, probes run on the configured interval. A failed probe
//! moves the entry to `error` and triggers exactly one reconnect sequence
//! under the same backoff contract as the initial connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::config::TransportKind;
use crate::registry::ServerEntry;
use crate::status::{StatusEvent, StatusNotifier};
use crate::supervisor::ConnectionSupervisor;

/// Default probe interval.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

// ─── HealthMonitor ───────────────────────────────────────────────────────────

/// Spawns and owns the per-server probe loop.
#[derive(Clone)]
pub struct HealthMonitor {
    supervisor: ConnectionSupervisor,
    notifier: StatusNotifier,
    interval: Duration,
    /// Probes are bounded by the same per-call timeout as ordinary tool calls.
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        supervisor: ConnectionSupervisor,
        notifier: StatusNotifier,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            notifier,
            interval,
            probe_timeout,
        }
    }

    /// Start the probe loop for a connected entry and return its task handle.
    ///
    /// The caller stores the handle on the entry so a disconnect can cancel
    /// the timer (and any in-flight reconnect wait) before closing the
    /// transport.
    pub fn spawn(&self, entry: Arc<ServerEntry>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            monitor.run(entry).await;
        })
    }

    async fn run(&self, entry: Arc<ServerEntry>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let Some(transport) = entry.transport().await else {
                // Disconnected underneath us; nothing left to monitor
                return;
            };

            let start = Instant::now();
            let outcome = tokio::time::timeout(self.probe_timeout, transport.probe()).await;

            let error = match outcome {
                Ok(Ok(())) => {
                    let latency_ms = start.elapsed().as_millis() as u64;
                    entry.record_probe(latency_ms);
                    tracing::trace!(server = %entry.name(), latency_ms, "probe ok");
                    continue;
                }
                Ok(Err(e)) => e,
                Err(_) => crate::errors::BridgeError::Timeout {
                    server: entry.name().to_string(),
                    timeout_ms: self.probe_timeout.as_millis() as u64,
                },
            };

            tracing::warn!(server = %entry.name(), error = %error, "health probe failed");
            entry.mark_error(&error.to_string());
            self.notifier.emit(StatusEvent::Error {
                server: entry.name().to_string(),
                message: error.to_string(),
            });

            // Credential rejections cannot be fixed by reconnecting; the
            // caller has to supply new auth and reconnect explicitly.
            if !error.is_retryable() {
                return;
            }
            if entry.config.kind == TransportKind::Socket && !entry.config.reconnect.enabled {
                return;
            }

            // Serialize against an explicit disconnect for this name
            let reconnected = {
                let _guard = entry.lifecycle.lock().await;
                self.supervisor.reconnect(&entry).await
            };

            match reconnected {
                Ok(_) => {
                    tracing::info!(server = %entry.name(), "reconnected after failed probe");
                    ticker.reset();
                }
                Err(e) => {
                    // Entry is in `error`; only a caller-initiated reconnect
                    // clears it, so the monitor stops here.
                    tracing::warn!(server = %entry.name(), error = %e, "reconnect failed, monitor stopping");
                    return;
                }
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::status::ConnectionState;
    use crate::supervisor::BackoffPolicy;

    fn monitor(interval_ms: u64) -> (HealthMonitor, StatusNotifier) {
        let notifier = StatusNotifier::new();
        let backoff = BackoffPolicy {
            base_delay: Duration::from_millis(1),
            cap_delay: Duration::from_millis(2),
        };
        let supervisor = ConnectionSupervisor::new(notifier.clone(), backoff);
        (
            HealthMonitor::new(
                supervisor,
                notifier.clone(),
                Duration::from_millis(interval_ms),
                Duration::from_millis(500),
            ),
            notifier,
        )
    }

    /// A pipe server that answers every request with a result line.
    fn responsive_pipe() -> ServerConfig {
        let script = r#"while read line; do
id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
printf '{"id": %s, "result": {"tools": []}}\n' "$id"
done"#;
        ServerConfig::process_pipe("local", "sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn test_probe_success_updates_last_ping() {
        let (monitor, _notifier) = monitor(1_000);

        let entry = Arc::new(crate::registry::ServerEntry::new(responsive_pipe()));
        let supervisor =
            ConnectionSupervisor::new(StatusNotifier::new(), BackoffPolicy::default());
        let transport = supervisor.establish(&entry).await.unwrap();

        let before = entry.status().last_ping;
        let handle = monitor.spawn(entry.clone());
        // First tick is immediate; give the probe a moment to round-trip
        tokio::time::sleep(Duration::from_millis(300)).await;

        let status = entry.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert!(status.latency_ms.is_some());
        assert!(status.last_ping >= before);

        handle.abort();
        transport.close().await;
    }

    #[tokio::test]
    async fn test_probe_failure_sets_error_and_emits() {
        let (monitor, notifier) = monitor(1_000);
        let mut rx = notifier.subscribe();

        // `true` exits immediately, so the first probe hits a closed pipe
        let config = ServerConfig::process_pipe("local", "true", vec![])
            .with_max_connect_retries(0);
        let entry = Arc::new(crate::registry::ServerEntry::new(config));
        let supervisor =
            ConnectionSupervisor::new(StatusNotifier::new(), BackoffPolicy::default());
        let transport = supervisor.establish(&entry).await.unwrap();

        let handle = monitor.spawn(entry.clone());
        tokio::time::sleep(Duration::from_millis(500)).await;

        // The probe failed against the exited process and an Error event fired
        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, StatusEvent::Error { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error, "expected an Error status event");

        handle.abort();
        transport.close().await;
    }

    #[tokio::test]
    async fn test_auth_probe_failure_does_not_reconnect() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (monitor, notifier) = monitor(50);
        let mut rx = notifier.subscribe();

        // A server that rejects every request with HTTP 401
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await;
            }
        });

        // Request-reply construction does no I/O, so the connect itself
        // succeeds in one attempt; the immediate first probe hits the 401
        let config = ServerConfig::request_reply("remote", &format!("http://{addr}/tools"));
        let entry = Arc::new(crate::registry::ServerEntry::new(config));
        let supervisor =
            ConnectionSupervisor::new(StatusNotifier::new(), BackoffPolicy::default());
        supervisor.establish(&entry).await.unwrap();

        let handle = monitor.spawn(entry.clone());
        tokio::time::sleep(Duration::from_millis(400)).await;

        let status = entry.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.last_error.unwrap().contains("credentials"));

        // Credential rejection stops the monitor instead of reconnecting
        assert!(handle.is_finished());
        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, StatusEvent::Error { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);
        server.abort();
    }

    #[tokio::test]
    async fn test_monitor_exits_when_disconnected() {
        let (monitor, _notifier) = monitor(50);

        let entry = Arc::new(crate::registry::ServerEntry::new(responsive_pipe()));
        // No transport installed: the monitor must exit on its first tick
        let handle = monitor.spawn(entry.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_cancelled_monitor_fires_no_further_probes() {
        let (monitor, _notifier) = monitor(50);

        let entry = Arc::new(crate::registry::ServerEntry::new(responsive_pipe()));
        let supervisor =
            ConnectionSupervisor::new(StatusNotifier::new(), BackoffPolicy::default());
        let transport = supervisor.establish(&entry).await.unwrap();

        let handle = monitor.spawn(entry.clone());
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ping_after_cancel = entry.status().last_ping;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(entry.status().last_ping, ping_after_cancel);

        transport.close().await;
    }
}
