//! Chain runner: batched tool invocations, sequential or concurrent.
//!
//! A chain run never fails as a whole: every step lands in its slot of the
//! result list as a result or an error. Sequential mode records step N's
//! outcome before step N+1 starts and can wait on long-running operations by
//! polling the reserved status tool; concurrent mode issues everything at
//! once and lets each step settle independently.

use std::time::Duration;

use futures::future::join_all;
use uuid::Uuid;

use crate::errors::BridgeError;
use crate::executor::{ToolExecutor, ToolOutcome};
use crate::protocol::OPERATION_STATUS;

/// Poll cadence while waiting for a long-running operation.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll budget per waited step. Exhaustion stops waiting, it is not an error.
pub const DEFAULT_MAX_POLLS: u32 = 60;

// ─── Chain Types ─────────────────────────────────────────────────────────────

/// Execution mode for a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    /// Strict order; step N+1 starts only after step N's outcome is recorded.
    Sequential,
    /// All steps issued at once; each settles independently.
    Concurrent,
}

/// One tool invocation inside a chain.
#[derive(Debug, Clone)]
pub struct ChainStep {
    pub tool: String,
    pub arguments: serde_json::Value,
    /// In sequential mode, poll long-running operations to completion before
    /// moving on.
    pub wait_for_completion: bool,
}

impl ChainStep {
    pub fn new(tool: &str, arguments: serde_json::Value) -> Self {
        Self {
            tool: tool.to_string(),
            arguments,
            wait_for_completion: false,
        }
    }

    pub fn waited(tool: &str, arguments: serde_json::Value) -> Self {
        Self {
            wait_for_completion: true,
            ..Self::new(tool, arguments)
        }
    }
}

/// An ordered batch of tool invocations. Ephemeral; built per call.
#[derive(Debug, Clone)]
pub struct ToolChain {
    pub steps: Vec<ChainStep>,
    pub mode: ChainMode,
}

impl ToolChain {
    pub fn sequential(steps: Vec<ChainStep>) -> Self {
        Self {
            steps,
            mode: ChainMode::Sequential,
        }
    }

    pub fn concurrent(steps: Vec<ChainStep>) -> Self {
        Self {
            steps,
            mode: ChainMode::Concurrent,
        }
    }
}

/// Outcome of one chain step, at its original position.
#[derive(Debug)]
pub struct StepOutcome {
    pub position: usize,
    pub tool: String,
    pub result: Result<ToolOutcome, BridgeError>,
}

impl StepOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

// ─── ChainRunner ─────────────────────────────────────────────────────────────

/// Executes tool chains through a [`ToolExecutor`].
#[derive(Clone)]
pub struct ChainRunner {
    executor: ToolExecutor,
    poll_interval: Duration,
    max_polls: u32,
}

impl ChainRunner {
    pub fn new(executor: ToolExecutor) -> Self {
        Self {
            executor,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
        }
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls;
        self
    }

    /// Run a chain to completion. The returned list has one entry per step,
    /// in step order; a failed step never aborts the rest of the chain.
    pub async fn run(&self, chain: ToolChain) -> Vec<StepOutcome> {
        let run_id = Uuid::new_v4();
        tracing::info!(
            %run_id,
            steps = chain.steps.len(),
            mode = ?chain.mode,
            "running tool chain"
        );

        match chain.mode {
            ChainMode::Sequential => self.run_sequential(chain.steps).await,
            ChainMode::Concurrent => self.run_concurrent(chain.steps).await,
        }
    }

    async fn run_sequential(&self, steps: Vec<ChainStep>) -> Vec<StepOutcome> {
        let mut outcomes = Vec::with_capacity(steps.len());

        for (position, step) in steps.into_iter().enumerate() {
            let result = self.executor.execute(&step.tool, step.arguments).await;

            if step.wait_for_completion {
                if let Ok(outcome) = &result {
                    if let Some(token) = operation_token(&outcome.result) {
                        self.wait_for_operation(&step.tool, &token).await;
                    }
                }
            }

            outcomes.push(StepOutcome {
                position,
                tool: step.tool,
                result,
            });
        }

        outcomes
    }

    async fn run_concurrent(&self, steps: Vec<ChainStep>) -> Vec<StepOutcome> {
        let calls = steps.into_iter().enumerate().map(|(position, step)| {
            let executor = self.executor.clone();
            async move {
                let result = executor.execute(&step.tool, step.arguments).await;
                StepOutcome {
                    position,
                    tool: step.tool,
                    result,
                }
            }
        });

        join_all(calls).await
    }

    /// Poll the reserved status tool until the operation completes or the
    /// poll budget runs out. Budget exhaustion just stops waiting.
    async fn wait_for_operation(&self, tool: &str, token: &str) {
        for poll in 1..=self.max_polls {
            tokio::time::sleep(self.poll_interval).await;

            match self
                .executor
                .execute(OPERATION_STATUS, serde_json::json!({ "id": token }))
                .await
            {
                Ok(outcome) if operation_done(&outcome.result) => {
                    tracing::debug!(tool, token, polls = poll, "operation completed");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    // A transient status failure is not fatal to the chain;
                    // keep polling inside the budget
                    tracing::debug!(tool, token, error = %e, "operation status poll failed");
                }
            }
        }

        tracing::debug!(tool, token, budget = self.max_polls, "poll budget exhausted, proceeding");
    }
}

/// Extract a long-running operation token from a step result.
fn operation_token(result: &serde_json::Value) -> Option<String> {
    result
        .get("operationId")
        .or_else(|| result.get("operation_id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Whether an `operations/status` result reports completion.
fn operation_done(result: &serde_json::Value) -> bool {
    if result.get("done").and_then(|v| v.as_bool()) == Some(true) {
        return true;
    }
    result.get("status").and_then(|v| v.as_str()) == Some("completed")
}

// ─── Tests ───────────────────────────────────────────────────────────────────
