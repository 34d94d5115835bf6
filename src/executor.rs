//! Tool executor: server selection, invocation, and single failover.
//!
//! Picks the first connected server in selection order (ascending priority,
//! then name), invokes the tool with the per-call timeout, and on failure
//! retries exactly once on a different connected server. When the failover
//! also fails, or none exists, the original error is surfaced unmodified.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::errors::BridgeError;
use crate::registry::{ServerEntry, ServerRegistry};

/// Default timeout for one tool call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ─── ToolOutcome ─────────────────────────────────────────────────────────────

/// Result of a successful tool invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutcome {
    pub tool: String,
    /// The server that produced the result (the failover target when the
    /// first choice failed).
    pub server: String,
    pub result: serde_json::Value,
    pub execution_time_ms: u64,
}

// ─── ToolExecutor ────────────────────────────────────────────────────────────

/// Routes tool calls to connected servers through the registry.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ServerRegistry>,
    call_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self {
            registry,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Execute a named tool against the best available server.
    ///
    /// Fails immediately, without any I/O, when no server is connected.
    pub async fn execute(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome, BridgeError> {
        let connected = self.registry.connected();
        let Some(primary) = connected.first() else {
            return Err(BridgeError::NoServerAvailable);
        };

        let start = Instant::now();
        match self.call_on(primary, tool, arguments.clone()).await {
            Ok(result) => Ok(ToolOutcome {
                tool: tool.to_string(),
                server: primary.name().to_string(),
                result,
                execution_time_ms: start.elapsed().as_millis() as u64,
            }),
            Err(primary_err) => {
                tracing::warn!(
                    server = %primary.name(),
                    tool,
                    error = %primary_err,
                    "tool call failed, attempting failover"
                );
                self.failover(tool, arguments, primary, primary_err, start)
                    .await
            }
        }
    }

    /// Exactly one failover attempt on another connected server.
    async fn failover(
        &self,
        tool: &str,
        arguments: serde_json::Value,
        failed: &Arc<ServerEntry>,
        primary_err: BridgeError,
        start: Instant,
    ) -> Result<ToolOutcome, BridgeError> {
        let fallback = self
            .registry
            .connected()
            .into_iter()
            .find(|e| e.name() != failed.name());

        let Some(fallback) = fallback else {
            return Err(primary_err);
        };

        match self.call_on(&fallback, tool, arguments).await {
            Ok(result) => {
                tracing::info!(
                    tool,
                    failed = %failed.name(),
                    server = %fallback.name(),
                    "failover succeeded"
                );
                Ok(ToolOutcome {
                    tool: tool.to_string(),
                    server: fallback.name().to_string(),
                    result,
                    execution_time_ms: start.elapsed().as_millis() as u64,
                })
            }
            Err(failover_err) => {
                tracing::warn!(
                    tool,
                    server = %fallback.name(),
                    error = %failover_err,
                    "failover also failed, surfacing original error"
                );
                Err(primary_err)
            }
        }
    }

    /// One invocation on one server, bounded by the per-call timeout.
    async fn call_on(
        &self,
        entry: &Arc<ServerEntry>,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        let transport = entry.transport().await.ok_or_else(|| BridgeError::Closed {
            server: entry.name().to_string(),
            reason: Some("no live transport".into()),
        })?;

        match tokio::time::timeout(self.call_timeout, transport.call(tool, arguments)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout {
                server: entry.name().to_string(),
                timeout_ms: self.call_timeout.as_millis() as u64,
            }),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
