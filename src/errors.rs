//! Connection-manager error types.
//!
//! One enum covers the whole taxonomy: transport failures, connect-time
//! classification (auth vs network vs timeout vs TLS), and routing errors.
//! The supervisor's retry decisions are driven by [`BridgeError::is_retryable`].

use thiserror::Error;

/// Errors that can occur while connecting to or invoking tool servers.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Credential rejection (HTTP 401/403 or equivalent). Never retried.
    #[error("authentication failed for server '{server}': {detail}; credentials are missing or invalid")]
    Auth {
        server: String,
        detail: String,
    },

    /// Connection refused, DNS failure, or abrupt close during connect.
    #[error("connection to server '{server}' failed: {reason}")]
    Refused {
        server: String,
        reason: String,
    },

    /// The server did not respond within the configured timeout.
    #[error("server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        timeout_ms: u64,
    },

    /// TLS/certificate failure. Retryable, but usually indicates environment
    /// misconfiguration rather than transient unavailability.
    #[error("TLS error for server '{server}': {reason}; check the system clock and certificate store")]
    Tls {
        server: String,
        reason: String,
    },

    /// The underlying connection closed while a call was in flight.
    #[error("connection to server '{server}' closed{}", reason_suffix(.reason))]
    Closed {
        server: String,
        reason: Option<String>,
    },

    /// A server process failed to start.
    #[error("failed to spawn server '{server}': {reason}")]
    Spawn {
        server: String,
        reason: String,
    },

    /// Malformed frame or response from the server.
    #[error("protocol error from server '{server}': {reason}")]
    Protocol {
        server: String,
        reason: String,
    },

    /// The server accepted the call but reported a tool-level error.
    #[error("tool call failed on server '{server}': {message}")]
    ToolCall {
        server: String,
        message: String,
    },

    /// Tool invocation attempted on a one-directional event-stream transport.
    #[error("server '{server}' is push-only; tool calls are not supported on an event-stream transport")]
    PushOnly {
        server: String,
    },

    /// The transport kind string did not match any known variant.
    #[error("unsupported transport kind: '{kind}'")]
    UnsupportedTransport {
        kind: String,
    },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    Config {
        reason: String,
    },

    /// All connect attempts were consumed without success.
    #[error("server '{server}' unreachable after {attempts} attempts: {last_error}")]
    AttemptsExhausted {
        server: String,
        attempts: u32,
        last_error: String,
    },

    /// No registry entry is in the connected state. Raised synchronously,
    /// before any I/O is attempted.
    #[error("no connected tool server available")]
    NoServerAvailable,

    /// The named server is not registered.
    #[error("unknown server: '{name}'")]
    UnknownServer {
        name: String,
    },
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(r) => format!(": {r}"),
        None => String::new(),
    }
}

impl BridgeError {
    /// Whether a connect attempt that failed with this error should be retried.
    ///
    /// Authentication failures stop after exactly one attempt; configuration
    /// and capability errors cannot be fixed by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Refused { .. }
                | BridgeError::Timeout { .. }
                | BridgeError::Tls { .. }
                | BridgeError::Closed { .. }
                | BridgeError::Spawn { .. }
                | BridgeError::Protocol { .. }
        )
    }

    /// Whether this is a credential rejection.
    pub fn is_auth(&self) -> bool {
        matches!(self, BridgeError::Auth { .. })
    }

    /// The server name this error is tagged with, if any.
    pub fn server(&self) -> Option<&str> {
        match self {
            BridgeError::Auth { server, .. }
            | BridgeError::Refused { server, .. }
            | BridgeError::Timeout { server, .. }
            | BridgeError::Tls { server, .. }
            | BridgeError::Closed { server, .. }
            | BridgeError::Spawn { server, .. }
            | BridgeError::Protocol { server, .. }
            | BridgeError::ToolCall { server, .. }
            | BridgeError::PushOnly { server }
            | BridgeError::AttemptsExhausted { server, .. } => Some(server),
            BridgeError::UnknownServer { name } => Some(name),
            _ => None,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_is_not_retryable() {
        let err = BridgeError::Auth {
            server: "remote".into(),
            detail: "HTTP 401".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.is_auth());
    }

    #[test]
    fn test_auth_message_mentions_credentials() {
        let err = BridgeError::Auth {
            server: "remote".into(),
            detail: "HTTP 401".into(),
        };
        assert!(err.to_string().contains("credentials"));
    }

    #[test]
    fn test_network_errors_are_retryable() {
        let refused = BridgeError::Refused {
            server: "remote".into(),
            reason: "connection refused".into(),
        };
        let timeout = BridgeError::Timeout {
            server: "remote".into(),
            timeout_ms: 10_000,
        };
        let tls = BridgeError::Tls {
            server: "remote".into(),
            reason: "certificate expired".into(),
        };
        assert!(refused.is_retryable());
        assert!(timeout.is_retryable());
        assert!(tls.is_retryable());
    }

    #[test]
    fn test_timeout_message_distinct_from_refused() {
        let timeout = BridgeError::Timeout {
            server: "remote".into(),
            timeout_ms: 5_000,
        };
        let refused = BridgeError::Refused {
            server: "remote".into(),
            reason: "connection refused".into(),
        };
        assert!(timeout.to_string().contains("timed out"));
        assert!(!refused.to_string().contains("timed out"));
    }

    #[test]
    fn test_tls_message_recommends_clock_check() {
        let err = BridgeError::Tls {
            server: "remote".into(),
            reason: "certificate expired".into(),
        };
        assert!(err.to_string().contains("system clock"));
    }

    #[test]
    fn test_exhausted_message_states_attempt_count() {
        let err = BridgeError::AttemptsExhausted {
            server: "remote".into(),
            attempts: 4,
            last_error: "connection refused".into(),
        };
        assert!(err.to_string().contains("4 attempts"));
    }

    #[test]
    fn test_config_errors_are_terminal() {
        assert!(!BridgeError::Config { reason: "".into() }.is_retryable());
        assert!(!BridgeError::UnsupportedTransport { kind: "carrier-pigeon".into() }.is_retryable());
        assert!(!BridgeError::PushOnly { server: "feed".into() }.is_retryable());
        assert!(!BridgeError::NoServerAvailable.is_retryable());
    }

    #[test]
    fn test_server_tag() {
        let err = BridgeError::ToolCall {
            server: "local".into(),
            message: "boom".into(),
        };
        assert_eq!(err.server(), Some("local"));
        assert_eq!(BridgeError::NoServerAvailable.server(), None);
    }
}
