use std::sync::Arc;

use patchflow_agent::stages::keys::*;
use patchflow_agent::stages::{intake, locator, patcher};
use patchflow_agent::{Executor, RunStatus, StageDeps};
use patchflow_core::config::AppConfig;
use patchflow_core::types::Intent;
use patchflow_test_utils::{sample_issue, test_model_config, RecordingSandbox, ScriptedLlm};

const DIFF: &str = "\
diff --git a/blog/views.py b/blog/views.py
--- a/blog/views.py
+++ b/blog/views.py
@@ -1,2 +1,4 @@
 def post_detail(request):
+    if not request.POST.get(\"body\"):
+        return None
     return render(request)
";

fn config() -> AppConfig {
    AppConfig::parse(
        r#"
[model]
model_id = "test-model"

[patcher]
max_attempts = 2
branch_prefix = "patchflow/"
"#,
    )
    .unwrap()
}

fn model() -> ScriptedLlm {
    ScriptedLlm::new()
        .on("issue classifier", "BUG_FIX")
        .on("crash detector", "yes")
        .on(
            "entity extractor",
            r#"[{"file": "views.py", "function": "post_detail", "line": null, "repro_cmd": null}]"#,
        )
        .on("Summarize the core issue", "Posting an empty comment crashes post_detail.")
        .on(
            "code detective",
            r#"{"locations": [{"file": "blog/views.py", "function": "post_detail", "line": 1}],
                "explanation": "Reject empty bodies before rendering."}"#,
        )
}

fn repo_sandbox() -> RecordingSandbox {
    RecordingSandbox::new()
        .on("test -d", 1, "", "")
        .on("cd swe_agent && git rev-parse HEAD", 0, "0f1e2d3c\n", "")
        .on("find swe_agent", 0, "swe_agent/blog/views.py\nswe_agent/manage.py\n", "")
        .on(
            "nl -ba swe_agent/blog/views.py",
            0,
            "     1\tdef post_detail(request):\n     2\t    return render(request)\n",
            "",
        )
        .on("nl -ba swe_agent/manage.py", 0, "     1\timport sys\n", "")
}

#[tokio::test]
async fn test_issue_to_applied_patch() {
    let llm = Arc::new(model().on("software patch generator", DIFF));
    let sandbox = Arc::new(repo_sandbox());
    let deps = StageDeps::new(llm.clone(), test_model_config(), sandbox.clone(), Arc::new(config()));
    let executor = Executor::new();

    let issue = sample_issue(42, "Empty comment crash", "Submitting an empty comment raises a 500.");
    let intake_run = intake::run_intake(&executor, &deps, &issue).await.unwrap();
    assert_eq!(intake_run.status, RunStatus::Succeeded);
    let structured = intake_run.terminal_state.get(&STRUCTURED_ISSUE).unwrap();
    assert_eq!(structured.intent, Intent::BugFix);

    let locator_run = locator::run_locator(&executor, &deps, &structured, "https://github.com/acme/blog.git")
        .await
        .unwrap();
    assert_eq!(locator_run.status, RunStatus::Succeeded);

    let initial = patcher::patcher_state(&locator_run.terminal_state).unwrap();
    let outcome = patcher::run_patcher(&executor, &deps, &initial).await.unwrap();

    assert!(outcome.succeeded());
    assert_eq!(outcome.attempts, 1);
    let state = &outcome.result.terminal_state;
    assert_eq!(state.get(&BRANCH).unwrap(), "patchflow/1042");
    assert!(state.get(&APPLIED_OK).unwrap());
    assert_eq!(
        sandbox.commands_starting_with("git clone"),
        vec!["git clone https://github.com/acme/blog.git swe_agent".to_string()]
    );
    assert!(sandbox
        .commands_starting_with("cd swe_agent && git reset --hard")
        .iter()
        .all(|c| c.ends_with("git checkout -B patchflow/1042 0f1e2d3c")));

    // Intake: 4 calls, locator: 1, patcher: 1
    assert_eq!(llm.call_count(), 6);
}

#[tokio::test]
async fn test_unappliable_patch_exhausts_retries() {
    let llm = Arc::new(model().on("software patch generator", DIFF));
    let sandbox = Arc::new(repo_sandbox().on("cd swe_agent && git apply", 1, "", "error: patch does not apply"));
    let deps = StageDeps::new(llm.clone(), test_model_config(), sandbox.clone(), Arc::new(config()));
    let executor = Executor::new();

    let issue = sample_issue(43, "Empty comment crash", "Submitting an empty comment raises a 500.");
    let structured = intake::run_intake(&executor, &deps, &issue)
        .await
        .unwrap()
        .terminal_state
        .get(&STRUCTURED_ISSUE)
        .unwrap();
    let locator_run = locator::run_locator(&executor, &deps, &structured, "https://github.com/acme/blog.git")
        .await
        .unwrap();
    let initial = patcher::patcher_state(&locator_run.terminal_state).unwrap();
    let outcome = patcher::run_patcher(&executor, &deps, &initial).await.unwrap();

    assert!(!outcome.succeeded());
    assert_eq!(outcome.result.status, RunStatus::Aborted);
    assert_eq!(outcome.attempts, 2);
    let last = outcome.last_failure().unwrap();
    assert!(last.diagnostic_text().contains("error: patch does not apply"));
    assert_eq!(llm.prompts_containing("Attempt 1 produced a patch").len(), 1);
}

#[tokio::test]
async fn test_cancelled_executor_aborts_intake() {
    let llm = Arc::new(model());
    let deps = StageDeps::new(llm.clone(), test_model_config(), Arc::new(RecordingSandbox::new()), Arc::new(config()));
    let executor = Executor::new();
    executor.cancel_token().cancel();

    let run = intake::run_intake(&executor, &deps, &sample_issue(1, "t", "b")).await.unwrap();
    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(llm.call_count(), 0);
}
