//! The connection manager facade.
//!
//! An explicitly constructed [`ToolBridge`] owns the registry, the status
//! notifier, and the tunables, and wires the supervisor, health monitor,
//! executor, and chain runner together. Callers hold one instance and pass
//! it where it is needed; there is no global state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::chain::{ChainRunner, StepOutcome, ToolChain};
use crate::config::ServerConfig;
use crate::errors::BridgeError;
use crate::executor::{ToolExecutor, ToolOutcome, DEFAULT_CALL_TIMEOUT};
use crate::health::{HealthMonitor, DEFAULT_HEALTH_INTERVAL};
use crate::registry::ServerRegistry;
use crate::status::{ConnectionStatus, StatusEvent, StatusNotifier};
use crate::supervisor::{BackoffPolicy, ConnectionSupervisor};

// ─── ToolBridge ──────────────────────────────────────────────────────────────

/// Manages connections to a set of tool servers and routes tool calls.
///
/// Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct ToolBridge {
    registry: Arc<ServerRegistry>,
    notifier: StatusNotifier,
    supervisor: ConnectionSupervisor,
    health: HealthMonitor,
    executor: ToolExecutor,
}

impl ToolBridge {
    /// Create a bridge with default tunables.
    pub fn new() -> Self {
        Self::with_settings(
            BackoffPolicy::default(),
            DEFAULT_HEALTH_INTERVAL,
            DEFAULT_CALL_TIMEOUT,
        )
    }

    /// Create a bridge with explicit backoff, health interval, and per-call
    /// timeout. The defaults are starting points, not protocol constants.
    pub fn with_settings(
        backoff: BackoffPolicy,
        health_interval: Duration,
        call_timeout: Duration,
    ) -> Self {
        let registry = Arc::new(ServerRegistry::new());
        let notifier = StatusNotifier::new();
        let supervisor = ConnectionSupervisor::new(notifier.clone(), backoff);
        let health = HealthMonitor::new(
            supervisor.clone(),
            notifier.clone(),
            health_interval,
            call_timeout,
        );
        let executor = ToolExecutor::new(registry.clone()).with_call_timeout(call_timeout);

        Self {
            registry,
            notifier,
            supervisor,
            health,
            executor,
        }
    }

    /// Subscribe to the status notification stream.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.notifier.subscribe()
    }

    // ─── Connection Lifecycle ────────────────────────────────────────────

    /// Register and connect one server.
    ///
    /// Re-registering an existing name tears the prior entry down first.
    /// On success the server is `connected` and its health monitor is
    /// running; on failure the entry stays registered in `error` so the
    /// caller can inspect it and reconnect.
    pub async fn connect(&self, config: ServerConfig) -> Result<(), BridgeError> {
        config.validate()?;

        if self.registry.get(&config.name).is_some() {
            tracing::info!(server = %config.name, "replacing existing registration");
            self.registry.remove(&config.name).await;
        }

        let entry = self.registry.upsert(config);
        let _guard = entry.lifecycle.lock().await;
        self.supervisor.establish(&entry).await?;
        entry.set_health_task(self.health.spawn(entry.clone()));
        Ok(())
    }

    /// Connect a batch of servers concurrently.
    ///
    /// Dispatch order follows ascending priority, but connections proceed
    /// independently: one server's failure never blocks or fails another.
    /// The result maps every server name to its own outcome.
    pub async fn connect_all(
        &self,
        mut configs: Vec<ServerConfig>,
    ) -> BTreeMap<String, Result<(), BridgeError>> {
        configs.sort_by_key(|c| c.priority);

        let mut handles = Vec::with_capacity(configs.len());
        for config in configs {
            let name = config.name.clone();
            let bridge = self.clone();
            handles.push((
                name,
                tokio::spawn(async move { bridge.connect(config).await }),
            ));
        }

        let mut results = BTreeMap::new();
        for (name, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(BridgeError::Config {
                    reason: format!("connect task for '{name}' failed: {e}"),
                }),
            };
            results.insert(name, result);
        }

        results
    }

    /// Disconnect a server: cancel its health timer, abort any in-flight
    /// reconnect wait, close the transport, and drop the registry entry.
    pub async fn disconnect(&self, name: &str) -> Result<(), BridgeError> {
        self.registry
            .remove(name)
            .await
            .ok_or_else(|| BridgeError::UnknownServer {
                name: name.to_string(),
            })?;

        self.notifier.emit(StatusEvent::Disconnected {
            server: name.to_string(),
            reason: "disconnected by caller".into(),
        });
        Ok(())
    }

    /// Caller-initiated reconnect. The only way out of the `error` state.
    pub async fn reconnect(&self, name: &str) -> Result<(), BridgeError> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| BridgeError::UnknownServer {
                name: name.to_string(),
            })?;

        entry.cancel_health_task();
        let _guard = entry.lifecycle.lock().await;
        self.supervisor.reconnect(&entry).await?;
        entry.set_health_task(self.health.spawn(entry.clone()));
        Ok(())
    }

    /// Disconnect every registered server.
    pub async fn shutdown(&self) {
        for entry in self.registry.all() {
            let name = entry.name().to_string();
            if self.registry.remove(&name).await.is_some() {
                self.notifier.emit(StatusEvent::Disconnected {
                    server: name,
                    reason: "shutdown".into(),
                });
            }
        }
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute a tool against the best available server (§ executor policy).
    pub async fn execute(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome, BridgeError> {
        self.executor.execute(tool, arguments).await
    }

    /// Run a tool chain to completion.
    pub async fn run_chain(&self, chain: ToolChain) -> Vec<StepOutcome> {
        ChainRunner::new(self.executor.clone()).run(chain).await
    }

    /// The executor, for callers that drive invocations directly.
    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Status snapshots for every registered server.
    pub fn status(&self) -> Vec<ConnectionStatus> {
        self.registry.status_report()
    }

    /// Names of servers currently connected, in selection order.
    pub fn connected_servers(&self) -> Vec<String> {
        self.registry
            .connected()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    pub fn server_count(&self) -> usize {
        self.registry.len()
    }
}

impl Default for ToolBridge {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
