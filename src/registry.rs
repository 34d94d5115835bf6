//! Server registry: the single source of truth for what servers exist and
//! whether they are healthy.
//!
//! A pure data holder. Each entry pairs the immutable [`ServerConfig`] with
//! its mutable [`ConnectionStatus`], the live transport (exactly one at any
//! time), and the handle of its health task. Mutations for one name are
//! serialized through the entry's lifecycle lock; distinct servers mutate
//! fully in parallel.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::status::{ConnectionState, ConnectionStatus};
use crate::transport::ServerTransport;

// ─── ServerEntry ─────────────────────────────────────────────────────────────

/// One registered server: config, status, transport slot, health task.
pub struct ServerEntry {
    pub config: ServerConfig,
    status: std::sync::Mutex<ConnectionStatus>,
    transport: RwLock<Option<Arc<ServerTransport>>>,
    health_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Serializes supervisor-driven mutations (reconnect) against explicit
    /// disconnects for this one name.
    pub(crate) lifecycle: tokio::sync::Mutex<()>,
}

impl ServerEntry {
    pub fn new(config: ServerConfig) -> Self {
        let status = ConnectionStatus::new(&config.name);
        Self {
            config,
            status: std::sync::Mutex::new(status),
            transport: RwLock::new(None),
            health_task: std::sync::Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> ConnectionStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.lock().unwrap().state
    }

    /// The live transport, if connected.
    pub async fn transport(&self) -> Option<Arc<ServerTransport>> {
        self.transport.read().await.clone()
    }

    /// Swap a freshly connected transport into the entry.
    pub(crate) async fn install_transport(&self, transport: Arc<ServerTransport>) {
        *self.transport.write().await = Some(transport);
    }

    /// Take the transport out of the entry, leaving it empty.
    pub(crate) async fn take_transport(&self) -> Option<Arc<ServerTransport>> {
        self.transport.write().await.take()
    }

    pub(crate) fn mark_connecting(&self) {
        self.status.lock().unwrap().mark_connecting();
    }

    pub(crate) fn mark_connected(&self) {
        self.status.lock().unwrap().mark_connected();
    }

    pub(crate) fn mark_error(&self, message: &str) {
        self.status.lock().unwrap().mark_error(message);
    }

    pub(crate) fn mark_disconnected(&self) {
        self.status.lock().unwrap().mark_disconnected();
    }

    pub(crate) fn record_probe(&self, latency_ms: u64) {
        self.status.lock().unwrap().record_probe(latency_ms);
    }

    /// Store the health task handle, aborting any previous one.
    pub(crate) fn set_health_task(&self, handle: JoinHandle<()>) {
        let mut slot = self.health_task.lock().unwrap();
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Cancel the health timer. Also aborts an in-flight reconnect backoff
    /// wait, since reconnects run on the health task.
    pub(crate) fn cancel_health_task(&self) {
        if let Some(handle) = self.health_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

// ─── ServerRegistry ──────────────────────────────────────────────────────────

/// In-memory map from server name to its entry.
///
/// `BTreeMap` keeps iteration deterministic; callers that need the executor's
/// selection order use [`ServerRegistry::connected`], which sorts by priority
/// first.
pub struct ServerRegistry {
    entries: std::sync::RwLock<BTreeMap<String, Arc<ServerEntry>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self {
            entries: std::sync::RwLock::new(BTreeMap::new()),
        }
    }

    /// Insert a fresh entry for this config, replacing any prior entry with
    /// the same name. The caller is responsible for tearing down the prior
    /// entry first (see [`ServerRegistry::remove`]).
    pub fn upsert(&self, config: ServerConfig) -> Arc<ServerEntry> {
        let entry = Arc::new(ServerEntry::new(config));
        self.entries
            .write()
            .unwrap()
            .insert(entry.name().to_string(), entry.clone());
        entry
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServerEntry>> {
        self.entries.read().unwrap().get(name).cloned()
    }

    /// Remove an entry: cancels its health timer (and any in-flight reconnect
    /// wait), closes the transport, and marks it disconnected.
    pub async fn remove(&self, name: &str) -> Option<Arc<ServerEntry>> {
        let entry = self.entries.write().unwrap().remove(name)?;

        // Timer first, so a reconnect cannot race the deliberate shutdown
        entry.cancel_health_task();

        let _guard = entry.lifecycle.lock().await;
        if let Some(transport) = entry.take_transport().await {
            transport.close().await;
        }
        entry.mark_disconnected();
        drop(_guard);

        tracing::info!(server = %name, "server removed from registry");
        Some(entry)
    }

    /// All entries currently in the given state.
    pub fn list_by_state(&self, state: ConnectionState) -> Vec<Arc<ServerEntry>> {
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|e| e.state() == state)
            .cloned()
            .collect()
    }

    /// All entries, in name order.
    pub fn all(&self) -> Vec<Arc<ServerEntry>> {
        self.entries.read().unwrap().values().cloned().collect()
    }

    /// Connected entries in selection order: ascending priority, then name.
    pub fn connected(&self) -> Vec<Arc<ServerEntry>> {
        let mut entries = self.list_by_state(ConnectionState::Connected);
        entries.sort_by(|a, b| {
            a.config
                .priority
                .cmp(&b.config.priority)
                .then_with(|| a.config.name.cmp(&b.config.name))
        });
        entries
    }

    /// Status snapshots for every entry, in name order.
    pub fn status_report(&self) -> Vec<ConnectionStatus> {
        self.all().iter().map(|e| e.status()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
