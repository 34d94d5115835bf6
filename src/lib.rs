//! toolbridge: multi-transport connection manager for tool servers.
//!
//! Establishes, supervises, and uses connections to remote tool servers
//! speaking a JSON tool-invocation protocol over heterogeneous transports:
//! local process pipes, HTTP request/reply, WebSockets, and Server-Sent
//! Events. The [`ToolBridge`] facade owns all state; construct one and pass
//! it where it is needed.
//!
//! ```no_run
//! use toolbridge::{ServerConfig, ToolBridge};
//!
//! # async fn example() -> Result<(), toolbridge::BridgeError> {
//! let bridge = ToolBridge::new();
//! bridge
//!     .connect(ServerConfig::process_pipe(
//!         "memory",
//!         "uv",
//!         vec!["run".into(), "memory-server".into()],
//!     ))
//!     .await?;
//!
//! let outcome = bridge
//!     .execute("memory/store", serde_json::json!({"content": "note"}))
//!     .await?;
//! println!("{} answered in {}ms", outcome.server, outcome.execution_time_ms);
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod chain;
pub mod config;
pub mod errors;
pub mod executor;
pub mod health;
pub mod protocol;
pub mod registry;
pub mod status;
pub mod supervisor;
pub mod transport;

pub use bridge::ToolBridge;
pub use chain::{ChainMode, ChainRunner, ChainStep, StepOutcome, ToolChain};
pub use config::{ReconnectPolicy, ServerConfig, ServersFile, TransportKind};
pub use errors::BridgeError;
pub use executor::{ToolExecutor, ToolOutcome};
pub use health::HealthMonitor;
pub use registry::ServerRegistry;
pub use status::{ConnectionState, ConnectionStatus, StatusEvent, StatusNotifier};
pub use supervisor::{BackoffPolicy, ConnectionSupervisor};
pub use transport::{ServerTransport, TransportFactory};

/// Initialize the tracing subscriber for binaries embedding the bridge.
///
/// Reads `RUST_LOG` when set; defaults to info for this crate and warn for
/// everything else. Call once at startup.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("toolbridge=info,warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
