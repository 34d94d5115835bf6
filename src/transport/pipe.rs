//! Process-pipe transport: line-delimited JSON over a child's stdio.
//!
//! Spawns the configured command, writes one request per line to stdin, and
//! reads stdout lines until a response with the matching `id` arrives. The
//! child's lifetime is owned by the transport and ends on `close()`.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::config::ServerConfig;
use crate::errors::BridgeError;
use crate::protocol::{self, ToolRequest, ToolResponse};

/// Timeout for graceful exit before force-killing the child.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for stderr output when capturing failure context.
const STDERR_CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);

/// Cap on captured stderr, to keep error messages readable.
const STDERR_CAPTURE_LIMIT: usize = 2_000;

// ─── PipeTransport ───────────────────────────────────────────────────────────

/// Transport over a spawned child process's stdin/stdout.
///
/// Connected synchronously on construction; there is no handshake. Calls
/// hold the stdio pair for their full round trip, so concurrent callers
/// serialize per pipe and responses cannot be stolen across requests.
#[derive(Debug)]
pub struct PipeTransport {
    server: String,
    child: Mutex<Child>,
    io: Mutex<PipeIo>,
    stderr: Mutex<Option<ChildStderr>>,
}

#[derive(Debug)]
struct PipeIo {
    /// `None` once the transport is closed; dropping stdin is the EOF signal
    /// that tells a well-behaved child to exit.
    writer: Option<ChildStdin>,
    reader: BufReader<ChildStdout>,
}

impl PipeTransport {
    /// Spawn the configured command and wire its stdio for messaging.
    pub fn spawn(config: &ServerConfig) -> Result<Self, BridgeError> {
        let name = config.name.clone();
        let command = config.command.as_deref().ok_or_else(|| BridgeError::Config {
            reason: format!("server '{name}': process-pipe transport requires 'command'"),
        })?;

        let mut cmd = Command::new(command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| BridgeError::Spawn {
            server: name.clone(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| BridgeError::Spawn {
            server: name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| BridgeError::Spawn {
            server: name.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        Ok(Self {
            server: name,
            child: Mutex::new(child),
            io: Mutex::new(PipeIo {
                writer: Some(stdin),
                reader: BufReader::new(stdout),
            }),
            stderr: Mutex::new(stderr),
        })
    }

    /// Send a request and wait for the response with the matching `id`.
    ///
    /// Lines that are not parseable responses (server log noise) and
    /// responses for other ids are skipped.
    pub async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        let request = ToolRequest::with_id(name, arguments);
        let id = request.id;

        let mut line = serde_json::to_string(&request).map_err(|e| BridgeError::Protocol {
            server: self.server.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;
        line.push('\n');

        let mut io = self.io.lock().await;
        let writer = io
            .writer
            .as_mut()
            .ok_or_else(|| self.closed(Some("transport closed".into())))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.closed(Some(format!("failed to write to stdin: {e}"))))?;
        writer
            .flush()
            .await
            .map_err(|e| self.closed(Some(format!("failed to flush stdin: {e}"))))?;

        let mut buf = String::new();
        loop {
            buf.clear();
            let bytes_read = io
                .reader
                .read_line(&mut buf)
                .await
                .map_err(|e| self.closed(Some(format!("failed to read from stdout: {e}"))))?;

            if bytes_read == 0 {
                let context = self.stderr_context().await;
                return Err(self.closed(Some(match context {
                    Some(stderr) => format!("process exited; stderr: {stderr}"),
                    None => "process exited".to_string(),
                })));
            }

            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<ToolResponse>(trimmed) {
                Ok(resp) if resp.id == id => return protocol::extract_result(&self.server, resp),
                Ok(_) => continue,
                Err(_) => continue,
            }
        }
    }

    /// Cheapest liveness probe: a list-tools invocation.
    pub async fn probe(&self) -> Result<(), BridgeError> {
        self.call(protocol::LIST_TOOLS, serde_json::json!({})).await?;
        Ok(())
    }

    /// Shut the child down: best-effort shutdown message, bounded wait for
    /// exit, then kill.
    ///
    /// When a call is in flight (the stdio pair is busy) the child is killed
    /// immediately instead, which fails that call with a closed-connection
    /// error rather than letting the disconnect hang behind it.
    pub async fn close(&self) {
        let notified = match self.io.try_lock() {
            Ok(mut io) => {
                if let Some(writer) = io.writer.as_mut() {
                    let shutdown = ToolRequest::new("shutdown", serde_json::json!({}));
                    if let Ok(mut line) = serde_json::to_string(&shutdown) {
                        line.push('\n');
                        let _ = writer.write_all(line.as_bytes()).await;
                        let _ = writer.flush().await;
                    }
                }
                // Dropping stdin delivers EOF, the conventional exit signal
                io.writer = None;
                true
            }
            Err(_) => false,
        };

        let mut child = self.child.lock().await;
        if !notified {
            tracing::debug!(server = %self.server, "pipe busy during close, killing process");
            let _ = child.kill().await;
            return;
        }

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server, ?status, "server process exited");
            }
            _ => {
                tracing::warn!(server = %self.server, "server process did not exit, killing");
                let _ = child.kill().await;
            }
        }
    }

    /// Whether the child process is still running.
    pub async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    fn closed(&self, reason: Option<String>) -> BridgeError {
        BridgeError::Closed {
            server: self.server.clone(),
            reason,
        }
    }

    /// Read any available stderr output for diagnostics, bounded and truncated.
    async fn stderr_context(&self) -> Option<String> {
        use tokio::io::AsyncReadExt;

        let mut stderr_slot = self.stderr.lock().await;
        let mut stderr = stderr_slot.take()?;

        let mut buf = String::new();
        match tokio::time::timeout(STDERR_CAPTURE_TIMEOUT, stderr.read_to_string(&mut buf)).await {
            Ok(Ok(_)) if !buf.trim().is_empty() => {
                if buf.len() > STDERR_CAPTURE_LIMIT {
                    buf.truncate(STDERR_CAPTURE_LIMIT);
                    buf.push_str("...(truncated)");
                }
                Some(buf.trim().to_string())
            }
            _ => None,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
