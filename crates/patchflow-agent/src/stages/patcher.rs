//! Patcher: generate a unified diff and apply it on a fresh branch.
//!
//! `generate_patch` and `create_branch` run side by side; `apply_patch`
//! joins them. The whole graph is rerun by the [`RetryCoordinator`] until
//! the diff applies, each retry seeing why the previous one was rejected.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use patchflow_core::error::PatchflowError;
use patchflow_core::types::{Location, StructuredIssue};
use patchflow_tools::git;

use super::keys::*;
use super::{repo_relative, stage_node, StageDeps, StageError};
use crate::graph::{
    Executor, Graph, NodeError, RetryContext, RetryCoordinator, RetryOutcome, RetryPolicy, StateError, StateSnapshot,
    StateStore, StateUpdate, ValidationError, RETRY_CONTEXT,
};

const PATCHER_SYSTEM: &str = "You generate raw unified diff patches.";

/// Where the diff is written, relative to the checkout. Inside `.git` so
/// `git clean` and the patch itself never see it.
const PATCH_FILE: &str = ".git/patchflow.diff";

pub fn build_patcher_graph(deps: &StageDeps) -> Result<Graph, ValidationError> {
    Graph::build(
        vec![
            stage_node("generate_patch", deps, generate_patch)
                .requires(STRUCTURED_ISSUE)
                .requires(LOCATIONS)
                .requires(EXPLANATION)
                .requires(WORKDIR)
                .produces(PATCH),
            stage_node("create_branch", deps, create_branch)
                .requires(STRUCTURED_ISSUE)
                .requires(WORKDIR)
                .requires(BASE_REF)
                .produces(BRANCH),
            stage_node("apply_patch", deps, apply_patch)
                .requires(WORKDIR)
                .requires(PATCH)
                .requires(BRANCH)
                .produces(APPLIED_OK)
                .produces(APPLY_STDOUT)
                .produces(APPLY_STDERR),
        ],
        vec![],
        [
            STRUCTURED_ISSUE.name(),
            LOCATIONS.name(),
            EXPLANATION.name(),
            WORKDIR.name(),
            BASE_REF.name(),
        ],
    )
}

pub fn patcher_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, APPLIED_OK)
        .with_diagnostic_key(APPLY_STDERR)
        .with_diagnostic_key(APPLY_STDOUT)
        .with_raw_output_key(PATCH)
}

/// Seed the patcher from a finished locator run, which carries the
/// structured issue it was started with.
pub fn patcher_state(locator_state: &StateSnapshot) -> Result<StateStore, StateError> {
    let mut store = StateStore::new();
    for key in [
        STRUCTURED_ISSUE.name(),
        LOCATIONS.name(),
        EXPLANATION.name(),
        WORKDIR.name(),
        BASE_REF.name(),
    ] {
        let value = locator_state
            .get_raw(key)
            .ok_or_else(|| StateError::Missing(key.to_string()))?;
        store.seed_raw(key, value.clone());
    }
    Ok(store)
}

pub async fn run_patcher(
    executor: &Executor,
    deps: &StageDeps,
    initial: &StateStore,
) -> Result<RetryOutcome, StageError> {
    let policy = patcher_policy(deps.config.patcher.max_attempts);
    info!(max_attempts = policy.max_attempts, "patcher_started");
    let coordinator = RetryCoordinator::new(executor.clone());
    let outcome = coordinator
        .run_with_retry(|_, _| build_patcher_graph(deps), initial, &policy)
        .await?;
    Ok(outcome)
}

pub fn branch_name(prefix: &str, issue: &StructuredIssue) -> String {
    format!("{}{}", prefix, issue.id)
}

/// Reduce a model answer to the diff itself: no fences, nothing before the
/// first file header, exactly one trailing newline. Empty if no header.
pub fn clean_diff(raw: &str) -> String {
    let lines: Vec<&str> = raw.lines().filter(|l| !l.starts_with("```")).collect();
    let Some(start) = lines
        .iter()
        .position(|l| l.starts_with("diff --git") || l.starts_with("---"))
    else {
        return String::new();
    };
    let mut diff = lines[start..].join("\n");
    diff.truncate(diff.trim_end_matches(['\n', '\r']).len());
    diff.push('\n');
    diff
}

fn unique_files(locations: &[Location]) -> Vec<&str> {
    let mut seen = BTreeSet::new();
    locations
        .iter()
        .map(|l| l.file.as_str())
        .filter(|f| seen.insert(*f))
        .collect()
}

fn patch_prompt(
    issue: &StructuredIssue,
    explanation: &str,
    locations: &[Location],
    files: &[(String, String)],
    retry: Option<&RetryContext>,
) -> String {
    let loc_block = locations
        .iter()
        .map(|l| {
            format!(
                "- File `{}`, function `{}`, around line {}",
                l.file,
                l.function.as_deref().unwrap_or("unknown"),
                l.line.map_or_else(|| "unknown".to_string(), |n| n.to_string())
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let code = files
        .iter()
        .map(|(path, numbered)| format!("--- FULL FILE: {} ---\n```\n{}```", path, numbered))
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut prompt = format!(
        r#"You are a software patch generator.

Issue summary:
{summary}

Locator explanation:
{explanation}

Identified fix locations:
{loc_block}

Below are the full source files (with line numbers) for those locations.
The line numbers are for reference only and must not appear in the patch.
Paths are relative to the repository root; use a/<path> and b/<path> in the diff headers.

{code}
"#,
        summary = issue.summary,
        explanation = explanation,
        loc_block = loc_block,
        code = code,
    );

    if let Some(ctx) = retry {
        let failure = &ctx.previous_failure;
        prompt.push_str(&format!(
            "\nAttempt {} produced a patch that was rejected:\n{}\n",
            failure.attempt,
            failure.diagnostic_text()
        ));
        if let Some(previous) = failure.raw_output.as_ref().and_then(|v| v.as_str()) {
            prompt.push_str(&format!("\nRejected patch:\n{}\n", previous));
        }
        prompt.push_str("Fix the problem above in this new patch.\n");
    }

    prompt.push_str(
        "\nGenerate a unified diff patch that implements the necessary fix at the above locations. \
         Only output the raw unified diff, without ``` fences or Markdown formatting. \
         The before and after file paths in each header must name the same file.\n",
    );
    prompt
}

async fn generate_patch(deps: StageDeps, snapshot: StateSnapshot) -> Result<StateUpdate, NodeError> {
    let issue = snapshot.get(&STRUCTURED_ISSUE)?;
    let locations = snapshot.get(&LOCATIONS)?;
    let explanation = snapshot.get(&EXPLANATION)?;
    let workdir = snapshot.get(&WORKDIR)?;
    let retry = snapshot.get_opt(&RETRY_CONTEXT)?;

    if locations.is_empty() {
        return Err(NodeError::failed("no fix locations to patch"));
    }

    let mut files = Vec::new();
    for path in unique_files(&locations) {
        let rel = repo_relative(&workdir, path);
        let full = format!("{}/{}", workdir.trim_end_matches('/'), rel);
        match git::read_file_numbered(deps.sandbox.as_ref(), &full).await {
            Ok(numbered) => files.push((rel, numbered)),
            Err(e @ PatchflowError::SandboxUnavailable(_)) => return Err(e.into()),
            Err(e) => warn!(file = %full, error = %e, "Skipping unreadable location file"),
        }
    }

    let prompt = patch_prompt(&issue, &explanation, &locations, &files, retry.as_ref());
    let answer = deps.ask(PATCHER_SYSTEM, &prompt).await?;
    let patch = clean_diff(&answer);
    if patch.trim().is_empty() {
        return Err(NodeError::failed("model answer contained no unified diff"));
    }
    debug!(bytes = patch.len(), attempt = retry.map_or(1, |c| c.attempt_index), "Generated patch");
    Ok(StateUpdate::new().set(&PATCH, patch)?)
}

async fn create_branch(deps: StageDeps, snapshot: StateSnapshot) -> Result<StateUpdate, NodeError> {
    let issue = snapshot.get(&STRUCTURED_ISSUE)?;
    let workdir = snapshot.get(&WORKDIR)?;
    let base_ref = snapshot.get(&BASE_REF)?;
    let branch = branch_name(&deps.config.patcher.branch_prefix, &issue);

    git::reset_and_checkout_branch(deps.sandbox.as_ref(), &workdir, &branch, &base_ref).await?;
    info!(branch = %branch, base_ref = %base_ref, "Branch ready");
    Ok(StateUpdate::new().set(&BRANCH, branch)?)
}

async fn apply_patch(deps: StageDeps, snapshot: StateSnapshot) -> Result<StateUpdate, NodeError> {
    let workdir = snapshot.get(&WORKDIR)?;
    let patch = snapshot.get(&PATCH)?;
    let sandbox = deps.sandbox.as_ref();

    let patch_path = format!("{}/{}", workdir.trim_end_matches('/'), PATCH_FILE);
    git::write_file_heredoc(sandbox, &patch_path, &patch).await?;
    let out = git::apply_diff(sandbox, &workdir, PATCH_FILE, deps.config.patcher.strip_components).await?;

    let applied = out.success();
    if applied {
        info!(workdir = %workdir, "Patch applied");
    } else {
        warn!(exit_code = out.exit_code, stderr = %out.stderr.trim(), "Patch rejected");
    }
    Ok(StateUpdate::new()
        .set(&APPLIED_OK, applied)?
        .set(&APPLY_STDOUT, out.stdout)?
        .set(&APPLY_STDERR, out.stderr)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use patchflow_core::config::AppConfig;
    use patchflow_core::types::Intent;
    use patchflow_test_utils::{test_model_config, RecordingSandbox, ScriptedLlm};

    use crate::graph::RunStatus;

    const DIFF: &str = "diff --git a/blog/views.py b/blog/views.py\n--- a/blog/views.py\n+++ b/blog/views.py\n@@ -1 +1,2 @@\n def post_detail(request):\n+    pass\n";

    fn issue() -> StructuredIssue {
        StructuredIssue {
            id: 1007,
            number: 7,
            title: "Comment crash".into(),
            intent: Intent::BugFix,
            is_crash: true,
            entities: vec![],
            summary: "Empty comments crash post_detail.".into(),
        }
    }

    fn initial() -> StateStore {
        StateStore::new()
            .seed(&STRUCTURED_ISSUE, &issue())
            .unwrap()
            .seed(
                &LOCATIONS,
                &vec![
                    Location {
                        file: "blog/views.py".into(),
                        function: Some("post_detail".into()),
                        line: Some(1),
                    },
                    Location {
                        file: "blog/views.py".into(),
                        function: None,
                        line: None,
                    },
                ],
            )
            .unwrap()
            .seed(&EXPLANATION, &"Validate the form.".to_string())
            .unwrap()
            .seed(&WORKDIR, &"swe_agent".to_string())
            .unwrap()
            .seed(&BASE_REF, &"abc123".to_string())
            .unwrap()
    }

    fn deps(llm: Arc<ScriptedLlm>, sandbox: Arc<RecordingSandbox>, max_attempts: u32) -> StageDeps {
        let mut config = AppConfig::parse("[model]\nmodel_id = \"m\"\n").unwrap();
        config.patcher.max_attempts = max_attempts;
        StageDeps::new(llm, test_model_config(), sandbox, Arc::new(config))
    }

    fn views_sandbox() -> RecordingSandbox {
        RecordingSandbox::new().on("nl -ba swe_agent/blog/views.py", 0, "     1\tdef post_detail(request):\n", "")
    }

    #[test]
    fn test_clean_diff() {
        let raw = format!("Here is the patch:\n```diff\n{}```\n", DIFF);
        assert_eq!(clean_diff(&raw), DIFF);
        assert_eq!(clean_diff("--- a/x\n+++ b/x\n\n\n"), "--- a/x\n+++ b/x\n");
        assert_eq!(clean_diff("I cannot produce a patch."), "");
    }

    #[test]
    fn test_clean_diff_keeps_blank_context_line() {
        let raw = "--- a/x\n+++ b/x\n@@ -1,2 +1,2 @@\n-a\n+b\n \n";
        assert_eq!(clean_diff(raw), raw);
    }

    #[test]
    fn test_patcher_layers() {
        let plan = build_patcher_graph(&deps(Arc::new(ScriptedLlm::new()), Arc::new(RecordingSandbox::new()), 3))
            .unwrap()
            .plan();
        assert_eq!(plan.len(), 2);
        assert_eq!(
            plan.layers()[0],
            BTreeSet::from(["create_branch".to_string(), "generate_patch".to_string()])
        );
        assert_eq!(plan.layer_of("apply_patch"), Some(1));
    }

    #[test]
    fn test_patcher_state_requires_locator_output() {
        let snap = StateStore::new().snapshot();
        assert_eq!(
            patcher_state(&snap).unwrap_err(),
            StateError::Missing("structured_issue".into())
        );
        let store = patcher_state(&initial().snapshot()).unwrap();
        assert_eq!(store.keys().len(), 5);
    }

    #[tokio::test]
    async fn test_patch_applies_first_time() {
        let sandbox = Arc::new(views_sandbox());
        let llm = Arc::new(ScriptedLlm::new().on("software patch generator", &format!("```diff\n{}```", DIFF)));
        let outcome = run_patcher(&Executor::new(), &deps(llm.clone(), sandbox.clone(), 3), &initial())
            .await
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 1);
        let state = &outcome.result.terminal_state;
        assert_eq!(state.get(&BRANCH).unwrap(), "fix/issue-1007");
        assert_eq!(state.get(&PATCH).unwrap(), DIFF);

        // The duplicated location is read once
        assert_eq!(sandbox.commands_starting_with("nl -ba").len(), 1);
        let checkout = sandbox.commands_starting_with("cd swe_agent && git reset --hard");
        assert!(checkout[0].ends_with("git checkout -B fix/issue-1007 abc123"));
        assert!(sandbox
            .commands()
            .iter()
            .any(|c| c.starts_with("cat << 'PATCHFLOW_EOF_") && c.contains("> swe_agent/.git/patchflow.diff")));
        assert_eq!(
            sandbox.commands_starting_with("cd swe_agent && git apply"),
            vec!["cd swe_agent && git apply -p1 .git/patchflow.diff".to_string()]
        );
        assert!(llm.prompts()[0].contains("--- FULL FILE: blog/views.py ---"));
    }

    #[tokio::test]
    async fn test_rejected_patch_is_retried_with_stderr() {
        let sandbox = Arc::new(
            views_sandbox()
                .on("cd swe_agent && git apply", 1, "", "error: patch failed: blog/views.py:1")
                .on("cd swe_agent && git apply", 0, "", ""),
        );
        let llm = Arc::new(
            ScriptedLlm::new()
                .on("software patch generator", DIFF)
                .on("software patch generator", DIFF),
        );
        let outcome = run_patcher(&Executor::new(), &deps(llm.clone(), sandbox.clone(), 3), &initial())
            .await
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.history.len(), 1);

        // Each attempt resets the workspace before applying
        assert_eq!(sandbox.commands_starting_with("cd swe_agent && git reset --hard").len(), 2);
        let retry_prompts = llm.prompts_containing("Attempt 1 produced a patch that was rejected");
        assert_eq!(retry_prompts.len(), 1);
        assert!(retry_prompts[0].contains("apply_stderr: error: patch failed: blog/views.py:1"));
        assert!(retry_prompts[0].contains("Rejected patch:\ndiff --git"));
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let sandbox = Arc::new(views_sandbox().on("cd swe_agent && git apply", 1, "", "error: corrupt patch at line 6"));
        let llm = Arc::new(ScriptedLlm::new().on("software patch generator", DIFF));
        let outcome = run_patcher(&Executor::new(), &deps(llm.clone(), sandbox.clone(), 3), &initial())
            .await
            .unwrap();

        assert!(!outcome.succeeded());
        assert_eq!(outcome.result.status, RunStatus::Aborted);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(llm.call_count(), 3);
        assert_eq!(sandbox.commands_starting_with("cd swe_agent && git apply").len(), 3);
        assert_eq!(
            outcome.result.terminal_state.get(&APPLY_STDERR).unwrap(),
            "error: corrupt patch at line 6"
        );
    }

    #[tokio::test]
    async fn test_lost_sandbox_aborts_without_retry() {
        let sandbox = Arc::new(RecordingSandbox::new().unavailable_on("nl -ba"));
        let llm = Arc::new(ScriptedLlm::new().on("software patch generator", DIFF));
        let outcome = run_patcher(&Executor::new(), &deps(llm.clone(), sandbox, 3), &initial())
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.status, RunStatus::Aborted);
        assert!(matches!(outcome.result.per_node_errors["generate_patch"], NodeError::Fatal(_)));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_answer_without_diff_fails_attempt() {
        let sandbox = Arc::new(views_sandbox());
        let llm = Arc::new(ScriptedLlm::new().on("software patch generator", "Sorry, I can't help."));
        let outcome = run_patcher(&Executor::new(), &deps(llm, sandbox.clone(), 2), &initial())
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        assert!(outcome.history.iter().all(|f| f.node_errors.contains_key("generate_patch")));
        assert!(sandbox.commands_starting_with("cd swe_agent && git apply").is_empty());
    }
}
