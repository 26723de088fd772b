use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use patchflow_core::config::EngineConfig;

use super::builder::Graph;
use super::error::NodeError;
use super::plan::ExecutionPlan;
use super::state::{StateSnapshot, StateStore};

/// Overall outcome of one graph run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    PartiallyFailed,
    Aborted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::PartiallyFailed => "partially_failed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Completed,
    Failed,
    /// Never invoked: a predecessor did not complete or a required key was missing.
    Skipped,
}

/// Everything a caller gets back from [`Executor::run`].
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub terminal_state: StateSnapshot,
    pub per_node_errors: BTreeMap<String, NodeError>,
    pub node_states: BTreeMap<String, NodeState>,
    pub skipped: BTreeSet<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// One line per failed node, for reports.
    pub fn error_summary(&self) -> String {
        self.per_node_errors
            .iter()
            .map(|(node, e)| format!("{}: {}", node, e))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Runs a graph layer by layer.
///
/// All nodes of a layer are spawned together and see the same snapshot;
/// their updates are merged only once the whole layer has resolved. The
/// executor never retries a node.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    node_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let executor = Self::new();
        if config.node_timeout_secs == 0 {
            executor
        } else {
            executor.with_node_timeout(Duration::from_secs(config.node_timeout_secs))
        }
    }

    /// Default timeout for nodes that do not set their own.
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    /// Checked between layers; a fired token aborts the run.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Plan and run in one go.
    pub async fn run_graph(&self, graph: &Graph, initial_state: StateStore) -> RunResult {
        let plan = graph.plan();
        self.run(graph, &plan, initial_state).await
    }

    pub async fn run(&self, graph: &Graph, plan: &ExecutionPlan, initial_state: StateStore) -> RunResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();

        let mut store = initial_state;
        let mut node_states: BTreeMap<String, NodeState> = graph
            .node_names()
            .map(|n| (n.to_string(), NodeState::Pending))
            .collect();
        let mut per_node_errors = BTreeMap::new();
        let mut skipped = BTreeSet::new();
        let mut aborted = false;

        info!(%run_id, nodes = graph.len(), layers = plan.len(), "run_started");

        for (layer_idx, layer) in plan.layers().iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(%run_id, layer = layer_idx, "run_cancelled");
                aborted = true;
                break;
            }

            let snapshot = store.snapshot();
            debug!(%run_id, layer = layer_idx, size = layer.len(), "layer_started");

            let mut ready = Vec::new();
            for name in layer {
                let Some(node) = graph.node(name) else {
                    warn!(%run_id, node = %name, "Planned node not in graph");
                    continue;
                };

                // Every predecessor must have completed, whatever plan was passed in
                let blocked_by = graph
                    .predecessors(name)
                    .find(|p| node_states.get(*p) != Some(&NodeState::Completed));
                let missing = node.requires.iter().find(|k| !snapshot.contains(k));

                if blocked_by.is_some() || missing.is_some() {
                    info!(
                        %run_id,
                        node = %name,
                        blocked_by = blocked_by.unwrap_or(""),
                        missing_key = missing.map(String::as_str).unwrap_or(""),
                        "node_skipped"
                    );
                    node_states.insert(name.clone(), NodeState::Skipped);
                    skipped.insert(name.clone());
                    continue;
                }

                node_states.insert(name.clone(), NodeState::Running);
                ready.push(node);
            }

            let handles: Vec<_> = ready
                .iter()
                .map(|node| {
                    let handler = node.handler();
                    let snap = snapshot.clone();
                    let timeout = node.timeout.or(self.node_timeout);
                    debug!(%run_id, node = %node.name, "node_started");
                    tokio::spawn(async move {
                        match timeout {
                            Some(t) => match tokio::time::timeout(t, handler.run(snap)).await {
                                Ok(result) => result,
                                Err(_) => Err(NodeError::Timeout(t.as_millis() as u64)),
                            },
                            None => handler.run(snap).await,
                        }
                    })
                })
                .collect();

            // Dropping the run mid-layer aborts the layer's tasks
            let _guard = AbortOnDrop(handles.iter().map(|h| h.abort_handle()).collect());
            let outcomes = futures::future::join_all(handles).await;

            // Merge at the layer boundary, in name order
            for (node, outcome) in ready.iter().zip(outcomes) {
                let result = match outcome {
                    Ok(result) => result,
                    Err(join_err) => Err(NodeError::Panicked(panic_message(join_err))),
                };
                let merged = result.and_then(|update| {
                    store
                        .apply(update, &node.produces, &node.updates)
                        .map_err(NodeError::from)
                });

                match merged {
                    Ok(()) => {
                        info!(%run_id, node = %node.name, layer = layer_idx, "node_completed");
                        node_states.insert(node.name.clone(), NodeState::Completed);
                    }
                    Err(e) => {
                        warn!(%run_id, node = %node.name, layer = layer_idx, error = %e, "node_failed");
                        if e.is_fatal() {
                            aborted = true;
                        }
                        node_states.insert(node.name.clone(), NodeState::Failed);
                        per_node_errors.insert(node.name.clone(), e);
                    }
                }
            }

            if aborted {
                warn!(%run_id, layer = layer_idx, "Fatal node error, not dispatching further layers");
                break;
            }
        }

        let status = if aborted {
            RunStatus::Aborted
        } else if node_states.values().all(|s| *s == NodeState::Completed) {
            RunStatus::Succeeded
        } else {
            RunStatus::PartiallyFailed
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            %run_id,
            %status,
            failed = per_node_errors.len(),
            skipped = skipped.len(),
            elapsed_ms,
            "run_finished"
        );

        RunResult {
            run_id,
            status,
            terminal_state: store.snapshot(),
            per_node_errors,
            node_states,
            skipped,
            started_at,
            elapsed_ms,
        }
    }
}

struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "task cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
