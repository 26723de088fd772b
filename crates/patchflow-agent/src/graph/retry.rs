use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use super::builder::Graph;
use super::error::ValidationError;
use super::executor::{Executor, RunResult, RunStatus};
use super::state::{StateKey, StateStore};

/// Reserved key under which each retry attempt receives its [`RetryContext`].
pub const RETRY_CONTEXT: StateKey<RetryContext> = StateKey::new("retry_context");

/// Where the coordinator reads success and diagnostics from.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Boolean key that must be `true` in the terminal state.
    pub success_key: String,
    /// Keys copied verbatim into the next attempt's context.
    pub diagnostic_keys: Vec<String>,
    pub raw_output_key: Option<String>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, success_key: impl AsRef<str>) -> Self {
        Self {
            max_attempts,
            success_key: success_key.as_ref().to_string(),
            diagnostic_keys: vec![],
            raw_output_key: None,
        }
    }

    pub fn with_diagnostic_key(mut self, key: impl AsRef<str>) -> Self {
        self.diagnostic_keys.push(key.as_ref().to_string());
        self
    }

    pub fn with_raw_output_key(mut self, key: impl AsRef<str>) -> Self {
        self.raw_output_key = Some(key.as_ref().to_string());
        self
    }
}

/// What went wrong in one failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousFailure {
    pub attempt: u32,
    pub status: RunStatus,
    pub diagnostic_payload: BTreeMap<String, Value>,
    #[serde(default)]
    pub raw_output: Option<Value>,
    #[serde(default)]
    pub node_errors: BTreeMap<String, String>,
}

impl PreviousFailure {
    fn from_result(attempt: u32, result: &RunResult, policy: &RetryPolicy) -> Self {
        let state = &result.terminal_state;
        let diagnostic_payload = policy
            .diagnostic_keys
            .iter()
            .filter_map(|k| state.get_raw(k).map(|v| (k.clone(), v.clone())))
            .collect();
        let raw_output = policy
            .raw_output_key
            .as_deref()
            .and_then(|k| state.get_raw(k))
            .cloned();
        let node_errors = result
            .per_node_errors
            .iter()
            .map(|(n, e)| (n.clone(), e.to_string()))
            .collect();
        Self {
            attempt,
            status: result.status,
            diagnostic_payload,
            raw_output,
            node_errors,
        }
    }

    /// Diagnostics and node errors flattened into readable text.
    pub fn diagnostic_text(&self) -> String {
        let mut parts = Vec::new();
        for (key, value) in &self.diagnostic_payload {
            let text = match value {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            };
            if !text.is_empty() {
                parts.push(format!("{}: {}", key, text));
            }
        }
        for (node, err) in &self.node_errors {
            parts.push(format!("node {} failed: {}", node, err));
        }
        parts.join("\n")
    }
}

/// Handed to the graph builder and seeded into the state of a retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryContext {
    /// The attempt about to run (2 or more).
    pub attempt_index: u32,
    pub previous_failure: PreviousFailure,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome {
    /// The last attempt's run. Status is forced to `Aborted` on exhaustion.
    pub result: RunResult,
    pub attempts: u32,
    /// Every failed attempt, oldest first.
    pub history: Vec<PreviousFailure>,
}

impl RetryOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.succeeded()
    }

    pub fn last_failure(&self) -> Option<&PreviousFailure> {
        self.history.last()
    }
}

/// Runs a whole graph repeatedly until a success predicate holds.
///
/// Every attempt gets a brand-new graph from the builder and a fresh copy of
/// the initial state. Side effects of failed attempts are not undone here.
pub struct RetryCoordinator {
    executor: Executor,
}

impl RetryCoordinator {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }

    pub async fn run_with_retry<B>(
        &self,
        mut graph_builder: B,
        initial_state: &StateStore,
        policy: &RetryPolicy,
    ) -> Result<RetryOutcome, ValidationError>
    where
        B: FnMut(u32, Option<&RetryContext>) -> Result<Graph, ValidationError>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut history: Vec<PreviousFailure> = Vec::new();
        let mut context: Option<RetryContext> = None;
        let mut attempt = 1;

        loop {
            info!(attempt, max_attempts, "attempt_started");
            let graph = graph_builder(attempt, context.as_ref())?;

            let mut store = initial_state.clone();
            if let Some(ctx) = &context {
                seed_context(&mut store, ctx);
            }

            let mut result = self.executor.run_graph(&graph, store).await;

            let predicate = result
                .terminal_state
                .get_raw(&policy.success_key)
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if result.status == RunStatus::Succeeded && predicate {
                info!(attempt, run_id = %result.run_id, "attempt_succeeded");
                return Ok(RetryOutcome {
                    result,
                    attempts: attempt,
                    history,
                });
            }

            let failure = PreviousFailure::from_result(attempt, &result, policy);
            warn!(
                attempt,
                status = %result.status,
                success_key = %policy.success_key,
                predicate,
                "attempt_failed"
            );
            history.push(failure.clone());

            // An aborted run (fatal node error or cancellation) is not retryable
            let stop = result.status == RunStatus::Aborted || self.executor.cancel_token().is_cancelled();
            if attempt >= max_attempts || stop {
                error!(attempts = attempt, max_attempts, "retry_exhausted");
                result.status = RunStatus::Aborted;
                return Ok(RetryOutcome {
                    result,
                    attempts: attempt,
                    history,
                });
            }

            attempt += 1;
            context = Some(RetryContext {
                attempt_index: attempt,
                previous_failure: failure,
            });
        }
    }
}

fn seed_context(store: &mut StateStore, ctx: &RetryContext) {
    match serde_json::to_value(ctx) {
        Ok(value) => store.seed_raw(RETRY_CONTEXT.name(), value),
        Err(e) => warn!(attempt = ctx.attempt_index, error = %e, "retry_context_not_seeded"),
    }
}
