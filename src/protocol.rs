//! Wire protocol types for tool invocation.
//!
//! All transports exchange the same message shape: a request naming a tool
//! with JSON arguments, answered by a result or an error string. Multiplexed
//! transports (process pipe, socket) additionally stamp requests with an `id`
//! so responses can be correlated; plain request-reply omits it.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::errors::BridgeError;

/// Reserved tool name used as the cheapest liveness probe on RPC-style
/// transports.
pub const LIST_TOOLS: &str = "tools/list";

/// Reserved tool name polled by the chain runner for long-running operations.
pub const OPERATION_STATUS: &str = "operations/status";

// ─── Request ID Generator ────────────────────────────────────────────────────

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID for correlation on multiplexed transports.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Messages ────────────────────────────────────────────────────────────────

/// A tool invocation request.
#[derive(Debug, Clone, Serialize)]
pub struct ToolRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolRequest {
    /// Create an uncorrelated request (request-reply transports).
    pub fn new(name: &str, arguments: serde_json::Value) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            arguments,
        }
    }

    /// Create a request with a fresh correlation ID (pipe/socket transports).
    pub fn with_id(name: &str, arguments: serde_json::Value) -> Self {
        Self {
            id: Some(next_request_id()),
            name: name.to_string(),
            arguments,
        }
    }
}

/// A tool invocation response: a result or an error message, never both.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Extract the result from a response, converting a server-reported error
/// into [`BridgeError::ToolCall`].
pub fn extract_result(server: &str, response: ToolResponse) -> Result<serde_json::Value, BridgeError> {
    if let Some(message) = response.error {
        return Err(BridgeError::ToolCall {
            server: server.to_string(),
            message,
        });
    }

    response.result.ok_or_else(|| BridgeError::Protocol {
        server: server.to_string(),
        reason: "response carries neither result nor error".into(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
