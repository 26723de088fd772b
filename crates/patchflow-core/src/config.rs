use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PatchflowError, Result};

/// Top-level patchflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub locator: LocatorConfig,
    #[serde(default)]
    pub patcher: PatcherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Extra HTTP headers sent with every request.
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Where issues come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_issue_state")]
    pub state: String,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: default_github_api_url(),
            token: None,
            state: default_issue_state(),
            per_page: default_per_page(),
            labels: vec![],
        }
    }
}

fn default_github_api_url() -> String { "https://api.github.com".to_string() }
fn default_issue_state() -> String { "open".to_string() }
fn default_per_page() -> u32 { 100 }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// Shell on this machine, under `sandbox.root`.
    #[default]
    Local,
    /// Remote Linux box from the Gbox API.
    Gbox,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub kind: SandboxKind,
    /// Base directory for local sessions.
    #[serde(default = "default_sandbox_root")]
    pub root: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_gbox_url")]
    pub base_url: String,
    /// Remote box lifetime, in the API's duration syntax.
    #[serde(default = "default_expires_in")]
    pub expires_in: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            kind: SandboxKind::default(),
            root: default_sandbox_root(),
            api_key: None,
            base_url: default_gbox_url(),
            expires_in: default_expires_in(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

fn default_sandbox_root() -> String { ".patchflow/sandboxes".to_string() }
fn default_gbox_url() -> String { "https://gbox.ai/api/v1".to_string() }
fn default_expires_in() -> String { "30m".to_string() }
fn default_command_timeout() -> u64 { 30 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-node handler timeout. 0 disables it.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_timeout_secs: default_node_timeout(),
        }
    }
}

fn default_node_timeout() -> u64 { 300 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatorConfig {
    /// Checkout directory inside the sandbox.
    #[serde(default = "default_workdir")]
    pub workdir: String,
    /// File extensions scanned for candidate locations.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_max_candidate_files")]
    pub max_candidate_files: usize,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            extensions: default_extensions(),
            max_candidate_files: default_max_candidate_files(),
        }
    }
}

fn default_workdir() -> String { "swe_agent".to_string() }
fn default_extensions() -> Vec<String> { vec!["py".to_string()] }
fn default_max_candidate_files() -> usize { 5 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatcherConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Leading path components stripped by `git apply -p`.
    #[serde(default = "default_strip_components")]
    pub strip_components: u32,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            branch_prefix: default_branch_prefix(),
            strip_components: default_strip_components(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_branch_prefix() -> String { "fix/issue-".to_string() }
fn default_strip_components() -> u32 { 1 }

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| PatchflowError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| PatchflowError::Config(e.to_string()))
    }

    /// Minimal config built from well-known environment variables.
    pub fn from_env() -> Self {
        let model_id =
            std::env::var("PATCHFLOW_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let gbox_key = std::env::var("GBOX_API_KEY").ok();

        Self {
            model: ModelConfig {
                provider: default_provider(),
                model_id,
                api_key: std::env::var("OPENAI_API_KEY").ok(),
                base_url: None,
                max_tokens: default_max_tokens(),
                temperature: default_temperature(),
                retry: Some(RetryConfig::default()),
                extra_headers: HashMap::new(),
            },
            fallback_models: vec![],
            github: GithubConfig {
                token: std::env::var("GITHUB_TOKEN").ok(),
                ..GithubConfig::default()
            },
            sandbox: SandboxConfig {
                kind: if gbox_key.is_some() {
                    SandboxKind::Gbox
                } else {
                    SandboxKind::Local
                },
                api_key: gbox_key,
                ..SandboxConfig::default()
            },
            engine: EngineConfig::default(),
            locator: LocatorConfig::default(),
            patcher: PatcherConfig::default(),
        }
    }

    /// Resolve the local sandbox root (expand ~).
    pub fn sandbox_root(&self) -> PathBuf {
        let root = &self.sandbox.root;
        if let Some(rest) = root.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(root)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_PATCHFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_PATCHFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_PATCHFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_PATCHFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_PATCHFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config = AppConfig::parse(
            r#"
[model]
model_id = "gpt-4o-mini"
"#,
        )
        .unwrap();
        assert_eq!(config.model.provider, "openai");
        assert!(config.model.retry.is_none());
        assert_eq!(config.github.api_url, "https://api.github.com");
        assert_eq!(config.github.per_page, 100);
        assert_eq!(config.sandbox.kind, SandboxKind::Local);
        assert_eq!(config.sandbox.command_timeout_secs, 30);
        assert_eq!(config.engine.node_timeout_secs, 300);
        assert_eq!(config.locator.workdir, "swe_agent");
        assert_eq!(config.locator.extensions, vec!["py"]);
        assert_eq!(config.locator.max_candidate_files, 5);
        assert_eq!(config.patcher.max_attempts, 3);
        assert_eq!(config.patcher.branch_prefix, "fix/issue-");
        assert_eq!(config.patcher.strip_components, 1);
    }

    #[test]
    fn test_missing_model_is_error() {
        let err = AppConfig::parse("[github]\nstate = \"all\"\n").unwrap_err();
        assert!(matches!(err, PatchflowError::Config(_)));
    }

    #[test]
    fn test_sandbox_kind_parse() {
        let config = AppConfig::parse(
            r#"
[model]
model_id = "m"

[sandbox]
kind = "gbox"
expires_in = "1h"
"#,
        )
        .unwrap();
        assert_eq!(config.sandbox.kind, SandboxKind::Gbox);
        assert_eq!(config.sandbox.expires_in, "1h");
        assert_eq!(config.sandbox.base_url, "https://gbox.ai/api/v1");
    }
}
