//! Deterministic stand-ins for the model, the sandbox and the issue host.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use patchflow_core::config::ModelConfig;
use patchflow_core::error::{PatchflowError, Result};
use patchflow_core::traits::{IssueSource, LlmClient, Sandbox};
use patchflow_core::types::*;

/// A queue of scripted replies for one pattern. The last reply repeats.
struct Script<T> {
    pattern: String,
    replies: VecDeque<T>,
}

impl<T: Clone> Script<T> {
    fn next(&mut self) -> Option<T> {
        if self.replies.len() > 1 {
            self.replies.pop_front()
        } else {
            self.replies.front().cloned()
        }
    }
}

fn push_script<T>(scripts: &mut Vec<Script<T>>, pattern: &str, reply: T) {
    if let Some(s) = scripts.iter_mut().find(|s| s.pattern == pattern) {
        s.replies.push_back(reply);
    } else {
        scripts.push(Script {
            pattern: pattern.to_string(),
            replies: VecDeque::from([reply]),
        });
    }
}

// ── ScriptedLlm ─────────────────────────────────────────────────

/// LLM stub: answers with the first script whose pattern occurs in any
/// message of the request. Registering a pattern twice queues replies.
#[derive(Default)]
pub struct ScriptedLlm {
    scripts: Mutex<Vec<Script<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, pattern: &str, reply: &str) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            push_script(&mut scripts, pattern, reply.to_string());
        }
        self
    }

    /// Every request so far, messages joined with blank lines.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.prompts().len()
    }

    /// Requests that mention `needle`.
    pub fn prompts_containing(&self, needle: &str) -> Vec<String> {
        self.prompts()
            .into_iter()
            .filter(|p| p.contains(needle))
            .collect()
    }
}

impl LlmClient for ScriptedLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.clone());
        }
        let reply = self.scripts.lock().ok().and_then(|mut scripts| {
            scripts
                .iter_mut()
                .find(|s| prompt.contains(&s.pattern))
                .and_then(|s| s.next())
        });

        Box::pin(async move {
            let Some(reply) = reply else {
                return Err(PatchflowError::LlmRequest(
                    "no scripted response for prompt".into(),
                ));
            };
            let deltas = vec![
                Ok(StreamDelta::TextDelta(reply)),
                Ok(StreamDelta::Stop(StopReason::EndTurn)),
            ];
            Ok(Box::pin(futures::stream::iter(deltas)) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

/// A model config for stubs; never sent anywhere.
pub fn test_model_config() -> ModelConfig {
    ModelConfig {
        provider: "openai".into(),
        model_id: "test-model".into(),
        api_key: Some("test-key".into()),
        base_url: None,
        max_tokens: 256,
        temperature: 0.0,
        retry: None,
        extra_headers: Default::default(),
    }
}

// ── RecordingSandbox ────────────────────────────────────────────

#[derive(Clone)]
enum Reply {
    Output(CommandOutput),
    Unavailable,
}

/// Sandbox stub: records every command and answers by prefix match.
/// Commands without a matching rule succeed with empty output.
#[derive(Default)]
pub struct RecordingSandbox {
    scripts: Mutex<Vec<Script<Reply>>>,
    commands: Mutex<Vec<String>>,
    releases: AtomicUsize,
}

impl RecordingSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, prefix: &str, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        let reply = Reply::Output(CommandOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
        if let Ok(mut scripts) = self.scripts.lock() {
            push_script(&mut scripts, prefix, reply);
        }
        self
    }

    /// Commands starting with `prefix` fail as if the session were gone.
    pub fn unavailable_on(self, prefix: &str) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            push_script(&mut scripts, prefix, Reply::Unavailable);
        }
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn commands_starting_with(&self, prefix: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl Sandbox for RecordingSandbox {
    fn name(&self) -> &str {
        "recording"
    }

    fn execute(&self, command: &str) -> BoxFuture<'_, Result<CommandOutput>> {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command.to_string());
        }
        let reply = self.scripts.lock().ok().and_then(|mut scripts| {
            scripts
                .iter_mut()
                .find(|s| command.starts_with(&s.pattern))
                .and_then(|s| s.next())
        });
        let command = command.to_string();
        Box::pin(async move {
            match reply {
                Some(Reply::Output(out)) => Ok(out),
                Some(Reply::Unavailable) => Err(PatchflowError::SandboxUnavailable(format!(
                    "scripted outage for: {}",
                    command
                ))),
                None => Ok(CommandOutput::default()),
            }
        })
    }

    fn release(&self) -> BoxFuture<'_, Result<()>> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

// ── StaticIssueSource ───────────────────────────────────────────

/// Issue source stub serving a fixed list.
pub struct StaticIssueSource {
    issues: Vec<RawIssue>,
}

impl StaticIssueSource {
    pub fn new(issues: Vec<RawIssue>) -> Self {
        Self { issues }
    }
}

impl IssueSource for StaticIssueSource {
    fn fetch_items(&self, query: &IssueQuery) -> BoxFuture<'_, Result<Vec<RawIssue>>> {
        let issues = self
            .issues
            .iter()
            .filter(|i| query.number.map_or(true, |n| i.number == n))
            .cloned()
            .collect();
        Box::pin(async move { Ok(issues) })
    }
}

/// A plausible open issue.
pub fn sample_issue(number: u64, title: &str, body: &str) -> RawIssue {
    RawIssue {
        id: 1000 + number,
        number,
        title: title.to_string(),
        body: body.to_string(),
        state: "open".to_string(),
        labels: vec![],
        created_at: "2024-05-01T12:00:00Z".to_string(),
        updated_at: "2024-05-02T12:00:00Z".to_string(),
    }
}
