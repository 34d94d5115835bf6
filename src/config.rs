//! Server configuration: transport kinds, per-server settings, file loading.
//!
//! A [`ServerConfig`] describes how to reach one tool server. Callers build
//! configs programmatically or load a JSON document listing several servers.
//! Credentials arrive already resolved; this layer only carries header maps.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::BridgeError;

/// Default connect timeout per attempt.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default number of retries after the initial connect attempt.
pub const DEFAULT_MAX_CONNECT_RETRIES: u32 = 3;

/// Default server priority. Lower sorts first.
pub const DEFAULT_PRIORITY: u32 = 100;

// ─── Transport Kind ──────────────────────────────────────────────────────────

/// The concrete I/O mechanism used to reach a tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Child process, line-delimited JSON over stdin/stdout.
    ProcessPipe,
    /// One HTTP POST per message, synchronous.
    RequestReply,
    /// Persistent WebSocket, bidirectional with server push.
    Socket,
    /// Server-Sent Events, push-only.
    EventStream,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessPipe => "process-pipe",
            Self::RequestReply => "request-reply",
            Self::Socket => "socket",
            Self::EventStream => "event-stream",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process-pipe" => Ok(Self::ProcessPipe),
            "request-reply" => Ok(Self::RequestReply),
            "socket" => Ok(Self::Socket),
            "event-stream" => Ok(Self::EventStream),
            other => Err(BridgeError::UnsupportedTransport {
                kind: other.to_string(),
            }),
        }
    }
}

// ─── Reconnect Policy ────────────────────────────────────────────────────────

/// Automatic reconnect behavior after a socket drops. Ignored by other
/// transport kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay_ms: 1_000,
        }
    }
}

// ─── Server Config ───────────────────────────────────────────────────────────

/// Identity and reachability of one tool server.
///
/// `name` is the registry key and immutable once registered; re-registering
/// the same name replaces the prior entry after closing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub kind: TransportKind,
    /// Endpoint URL. Required for request-reply, socket, and event-stream.
    #[serde(default)]
    pub url: Option<String>,
    /// Executable to spawn. Required for process-pipe.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the spawned process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Already-resolved auth headers (bearer token, API key, basic).
    #[serde(default)]
    pub auth_headers: HashMap<String, String>,
    /// Supplementary event-stream endpoint for request-reply servers.
    /// Attach failure is non-fatal; the primary channel stays connected.
    #[serde(default)]
    pub events_url: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_connect_retries")]
    pub max_connect_retries: u32,
    /// Lower sorts first when connecting a batch and when the executor
    /// selects a server.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_max_connect_retries() -> u32 {
    DEFAULT_MAX_CONNECT_RETRIES
}

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

impl ServerConfig {
    /// Config for a process-pipe server.
    pub fn process_pipe(name: &str, command: &str, args: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            kind: TransportKind::ProcessPipe,
            url: None,
            command: Some(command.to_string()),
            args,
            env: HashMap::new(),
            auth_headers: HashMap::new(),
            events_url: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_connect_retries: DEFAULT_MAX_CONNECT_RETRIES,
            priority: DEFAULT_PRIORITY,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Config for a request-reply (HTTP POST) server.
    pub fn request_reply(name: &str, url: &str) -> Self {
        Self {
            url: Some(url.to_string()),
            command: None,
            ..Self::process_pipe(name, "", Vec::new())
        }
        .with_kind(TransportKind::RequestReply)
    }

    /// Config for a socket (WebSocket) server.
    pub fn socket(name: &str, url: &str) -> Self {
        Self {
            url: Some(url.to_string()),
            command: None,
            ..Self::process_pipe(name, "", Vec::new())
        }
        .with_kind(TransportKind::Socket)
    }

    /// Config for a push-only event-stream server.
    pub fn event_stream(name: &str, url: &str) -> Self {
        Self {
            url: Some(url.to_string()),
            command: None,
            ..Self::process_pipe(name, "", Vec::new())
        }
        .with_kind(TransportKind::EventStream)
    }

    fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set an `Authorization: Bearer …` header from an already-resolved token.
    pub fn with_bearer(mut self, token: &str) -> Self {
        self.auth_headers
            .insert("Authorization".to_string(), format!("Bearer {token}"));
        self
    }

    /// Set an `X-Api-Key` header from an already-resolved key.
    pub fn with_api_key(mut self, key: &str) -> Self {
        self.auth_headers
            .insert("X-Api-Key".to_string(), key.to_string());
        self
    }

    /// Set an `Authorization: Basic …` header from an already-encoded
    /// credential string.
    pub fn with_basic(mut self, encoded: &str) -> Self {
        self.auth_headers
            .insert("Authorization".to_string(), format!("Basic {encoded}"));
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_connect_retries(mut self, retries: u32) -> Self {
        self.max_connect_retries = retries;
        self
    }

    pub fn with_events_url(mut self, url: &str) -> Self {
        self.events_url = Some(url.to_string());
        self
    }

    /// Check that the fields required by this config's transport kind are
    /// present and non-empty.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.name.trim().is_empty() {
            return Err(BridgeError::Config {
                reason: "server name must not be empty".into(),
            });
        }

        match self.kind {
            TransportKind::ProcessPipe => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err(BridgeError::Config {
                        reason: format!(
                            "server '{}': process-pipe transport requires 'command'",
                            self.name
                        ),
                    });
                }
            }
            TransportKind::RequestReply | TransportKind::Socket | TransportKind::EventStream => {
                if self.url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                    return Err(BridgeError::Config {
                        reason: format!(
                            "server '{}': {} transport requires 'url'",
                            self.name, self.kind
                        ),
                    });
                }
            }
        }

        Ok(())
    }
}

// ─── File Loading ────────────────────────────────────────────────────────────

/// Top-level shape of a `tool-servers.json` document.
#[derive(Debug, Clone, Deserialize)]
pub struct ServersFile {
    pub servers: Vec<ServerConfig>,
}

impl ServersFile {
    /// Load and validate server configs from a JSON file.
    ///
    /// Later entries with a duplicate name fully replace earlier ones, so a
    /// document can append overrides without editing the original entries.
    pub fn load(path: &Path) -> Result<Vec<ServerConfig>, BridgeError> {
        let text = std::fs::read_to_string(path).map_err(|e| BridgeError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;

        let file: ServersFile = serde_json::from_str(&text).map_err(|e| BridgeError::Config {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?;

        let mut by_name: Vec<ServerConfig> = Vec::new();
        for config in file.servers {
            config.validate()?;
            if let Some(existing) = by_name.iter_mut().find(|c| c.name == config.name) {
                tracing::debug!(server = %config.name, "override replaces earlier config entry");
                *existing = config;
            } else {
                by_name.push(config);
            }
        }

        Ok(by_name)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
