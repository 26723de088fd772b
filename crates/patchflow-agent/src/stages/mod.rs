//! The three pipeline stages, each expressed as a graph over shared state.
//!
//! Handlers get their collaborators through [`StageDeps`]; nothing in here
//! owns the sandbox session. The driver acquires and releases it.

pub mod intake;
pub mod keys;
pub mod locator;
pub mod patcher;

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use thiserror::Error;

use patchflow_core::config::{AppConfig, ModelConfig};
use patchflow_core::error::{PatchflowError, Result};
use patchflow_core::traits::{LlmClient, Sandbox};
use patchflow_core::types::{ChatMessage, CommandOutput, StreamDelta};

use crate::graph::{NodeError, NodeSpec, StateError, StateSnapshot, StateUpdate, ValidationError};

/// Why a stage could not be started.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to seed initial state: {0}")]
    State(#[from] StateError),
}

/// Collaborators shared by every node handler of a stage.
#[derive(Clone)]
pub struct StageDeps {
    pub llm: Arc<dyn LlmClient>,
    pub model: ModelConfig,
    pub sandbox: Arc<dyn Sandbox>,
    pub config: Arc<AppConfig>,
}

impl StageDeps {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        model: ModelConfig,
        sandbox: Arc<dyn Sandbox>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            llm,
            model,
            sandbox,
            config,
        }
    }

    /// Deps whose model and sandbox refuse every call. Enough to build and
    /// plan graphs without touching the network.
    pub fn offline(config: AppConfig) -> Self {
        Self {
            llm: Arc::new(OfflineLlm),
            model: config.model.clone(),
            sandbox: Arc::new(OfflineSandbox),
            config: Arc::new(config),
        }
    }

    /// One system + user exchange, trimmed.
    pub(crate) async fn ask(&self, system: &str, user: &str) -> std::result::Result<String, NodeError> {
        let text = patchflow_llm::complete_text(self.llm.as_ref(), &self.model, system, user).await?;
        Ok(text.trim().to_string())
    }
}

/// Build a node whose handler receives a clone of `deps` on every call.
pub(crate) fn stage_node<F, Fut>(name: &str, deps: &StageDeps, f: F) -> NodeSpec
where
    F: Fn(StageDeps, StateSnapshot) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<StateUpdate, NodeError>> + Send + 'static,
{
    let deps = deps.clone();
    NodeSpec::from_fn(name, move |snapshot| f(deps.clone(), snapshot))
}

/// The outermost `open ... close` span of a model answer, fences included
/// or not.
pub(crate) fn extract_json(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Normalise a path the model or `find` reported into one relative to the
/// repository root.
pub(crate) fn repo_relative(workdir: &str, path: &str) -> String {
    let wd = workdir.trim_end_matches('/');
    let mut p = path.trim();
    p = p.strip_prefix("./").unwrap_or(p);
    if let Some(rest) = p.strip_prefix(wd).and_then(|r| r.strip_prefix('/')) {
        p = rest;
    }
    for prefix in ["a/", "b/"] {
        if let Some(rest) = p.strip_prefix(prefix) {
            p = rest;
            break;
        }
    }
    p.to_string()
}

struct OfflineLlm;

impl LlmClient for OfflineLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        _messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        Box::pin(async { Err(PatchflowError::LlmRequest("offline: no model configured".into())) })
    }
}

struct OfflineSandbox;

impl Sandbox for OfflineSandbox {
    fn name(&self) -> &str {
        "offline"
    }

    fn execute(&self, command: &str) -> BoxFuture<'_, Result<CommandOutput>> {
        let command = command.to_string();
        Box::pin(async move {
            Err(PatchflowError::SandboxUnavailable(format!(
                "offline sandbox cannot run: {}",
                command
            )))
        })
    }

    fn release(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
