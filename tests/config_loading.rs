use std::io::Write;

use patchflow_core::config::{AppConfig, SandboxKind};
use patchflow_core::error::PatchflowError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[model]
provider = "groq"
model_id = "llama-3.3-70b-versatile"
api_key = "gsk-test-key"
max_tokens = 2048
temperature = 0.2

[model.retry]
max_retries = 5
initial_backoff_ms = 200

[model.extra_headers]
X-Team = "patchflow"

[[fallback_models]]
provider = "openai"
model_id = "gpt-4o-mini"

[github]
token = "ghp_test"
state = "all"
per_page = 50
labels = ["bug", "good first issue"]

[sandbox]
kind = "gbox"
api_key = "gbox-key"
expires_in = "1h"
command_timeout_secs = 120

[engine]
node_timeout_secs = 60

[locator]
workdir = "checkout"
extensions = ["py", "pyi"]
max_candidate_files = 8

[patcher]
max_attempts = 4
branch_prefix = "patchflow/"
strip_components = 0
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("parse config");

    assert_eq!(config.model.provider, "groq");
    assert_eq!(config.model.max_tokens, 2048);
    let retry = config.model.retry.as_ref().expect("retry section");
    assert_eq!(retry.max_retries, 5);
    assert_eq!(retry.initial_backoff_ms, 200);
    assert_eq!(retry.max_backoff_ms, 30000);
    assert_eq!(config.model.extra_headers["X-Team"], "patchflow");
    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].model_id, "gpt-4o-mini");

    assert_eq!(config.github.state, "all");
    assert_eq!(config.github.per_page, 50);
    assert_eq!(config.github.labels, vec!["bug", "good first issue"]);
    assert_eq!(config.github.api_url, "https://api.github.com");

    assert_eq!(config.sandbox.kind, SandboxKind::Gbox);
    assert_eq!(config.sandbox.command_timeout_secs, 120);
    assert_eq!(config.engine.node_timeout_secs, 60);

    assert_eq!(config.locator.workdir, "checkout");
    assert_eq!(config.locator.extensions, vec!["py", "pyi"]);
    assert_eq!(config.locator.max_candidate_files, 8);

    assert_eq!(config.patcher.max_attempts, 4);
    assert_eq!(config.patcher.branch_prefix, "patchflow/");
    assert_eq!(config.patcher.strip_components, 0);
}

#[test]
fn test_env_references_expanded_on_load() {
    std::env::set_var("PATCHFLOW_TEST_GH_TOKEN", "ghp_from_env");
    let toml_content = r#"
[model]
model_id = "gpt-4o-mini"
api_key = "${PATCHFLOW_TEST_UNSET_KEY}"

[github]
token = "${PATCHFLOW_TEST_GH_TOKEN}"
"#;
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("parse config");
    std::env::remove_var("PATCHFLOW_TEST_GH_TOKEN");

    assert_eq!(config.github.token.as_deref(), Some("ghp_from_env"));
    // Unset variables are left verbatim
    assert_eq!(config.model.api_key.as_deref(), Some("${PATCHFLOW_TEST_UNSET_KEY}"));
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, PatchflowError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_toml_is_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[model\nmodel_id = ").expect("write toml");
    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, PatchflowError::Config(_)));
}

#[test]
fn test_unknown_sandbox_kind_rejected() {
    let err = AppConfig::parse("[model]\nmodel_id = \"m\"\n\n[sandbox]\nkind = \"docker\"\n").unwrap_err();
    assert!(matches!(err, PatchflowError::Config(_)));
}
