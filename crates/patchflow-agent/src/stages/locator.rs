//! Locator: check the repository out in the sandbox and ask the model where
//! the issue should be fixed.

use serde::Deserialize;
use tracing::{debug, info, warn};

use patchflow_core::types::{Entity, FileContent, Location, LocatorResult, StructuredIssue};
use patchflow_tools::git;

use super::keys::*;
use super::{extract_json, repo_relative, stage_node, StageDeps, StageError};
use crate::graph::{
    Edge, Executor, Graph, NodeError, RunResult, StateError, StateSnapshot, StateStore, StateUpdate, ValidationError,
};

const LOCATOR_SYSTEM: &str = "You recommend code insertion points based on a bug summary and optional context.";

pub fn build_locator_graph(deps: &StageDeps) -> Result<Graph, ValidationError> {
    Graph::build(
        vec![
            stage_node("setup_workspace", deps, setup_workspace).produces(WORKDIR),
            stage_node("clone_repository", deps, clone_repository)
                .requires(REPO_URL)
                .requires(WORKDIR),
            stage_node("record_base_ref", deps, record_base_ref)
                .requires(WORKDIR)
                .produces(BASE_REF),
            stage_node("scan_source_files", deps, scan_source_files)
                .requires(WORKDIR)
                .produces(FILES),
            stage_node("locate_code", deps, locate_code)
                .requires(STRUCTURED_ISSUE)
                .requires(FILES)
                .produces(LOCATIONS)
                .produces(EXPLANATION),
        ],
        // Both need the checkout but read nothing the clone writes
        Edge::fan_out("clone_repository", ["record_base_ref", "scan_source_files"]),
        [STRUCTURED_ISSUE.name(), REPO_URL.name()],
    )
}

pub fn locator_state(issue: &StructuredIssue, repo_url: &str) -> Result<StateStore, StateError> {
    StateStore::new()
        .seed(&STRUCTURED_ISSUE, issue)?
        .seed(&REPO_URL, &repo_url.to_string())
}

pub async fn run_locator(
    executor: &Executor,
    deps: &StageDeps,
    issue: &StructuredIssue,
    repo_url: &str,
) -> Result<RunResult, StageError> {
    let graph = build_locator_graph(deps)?;
    let state = locator_state(issue, repo_url)?;
    info!(issue = issue.number, repo_url, "locator_started");
    Ok(executor.run_graph(&graph, state).await)
}

/// The locator's answer as stored in a terminal state.
pub fn locator_result(snapshot: &StateSnapshot) -> Result<LocatorResult, StateError> {
    Ok(LocatorResult {
        locations: snapshot.get(&LOCATIONS)?,
        explanation: snapshot.get(&EXPLANATION)?,
    })
}

/// Pick the files shown to the model. Files matching an entity's path come
/// first, the remainder fill up to `max` in path order.
pub fn select_candidates<'a>(files: &'a [FileContent], entities: &[Entity], max: usize) -> Vec<&'a FileContent> {
    let wanted: Vec<&str> = entities
        .iter()
        .filter_map(|e| e.file.as_deref())
        .map(|f| f.trim().trim_start_matches("./"))
        .filter(|f| !f.is_empty())
        .collect();
    let mentioned = |f: &FileContent| wanted.iter().any(|w| f.path.ends_with(w));

    let (mut picked, rest): (Vec<&FileContent>, Vec<&FileContent>) = files.iter().partition(|f| mentioned(*f));
    picked.extend(rest);
    picked.truncate(max);
    picked
}

#[derive(Deserialize)]
struct LocatorResponse {
    #[serde(default)]
    locations: Vec<Location>,
    #[serde(default)]
    explanation: String,
}

/// Parse the model's JSON answer. An unreadable answer yields no locations.
pub fn parse_locator_response(answer: &str, workdir: &str) -> LocatorResult {
    let parsed = extract_json(answer, '{', '}')
        .ok_or_else(|| "no JSON object".to_string())
        .and_then(|json| serde_json::from_str::<LocatorResponse>(json).map_err(|e| e.to_string()));
    match parsed {
        Ok(resp) => LocatorResult {
            locations: resp
                .locations
                .into_iter()
                .filter(|l| !l.file.trim().is_empty())
                .map(|l| Location {
                    file: repo_relative(workdir, &l.file),
                    ..l
                })
                .collect(),
            explanation: resp.explanation,
        },
        Err(e) => {
            warn!(error = %e, response = %answer, "Failed to parse locator response");
            LocatorResult::default()
        }
    }
}

fn locator_prompt(issue: &StructuredIssue, candidates: &[&FileContent]) -> String {
    let code = candidates
        .iter()
        .map(|f| format!("--- FILE: {}\n```\n{}\n```", f.path, f.content.trim_end()))
        .collect::<Vec<_>>()
        .join("\n\n");
    let entities = serde_json::to_string_pretty(&issue.entities).unwrap_or_default();

    format!(
        r#"You are a code detective. The bug summary is:
{summary}

Entities mentioned in the issue:
{entities}

Below are the candidate source files (with path and numbered content):
{code}

Based on the summary, recommend where to insert validation or fix code.
Respond with a JSON object with two keys:
  "locations": an array of {{"file": <path>, "function": <name|null>, "line": <number|null>}},
  "explanation": a brief English sentence explaining why.
Use the file paths exactly as shown above."#,
        summary = issue.summary,
        entities = entities,
        code = code,
    )
}

async fn setup_workspace(deps: StageDeps, _snapshot: StateSnapshot) -> Result<StateUpdate, NodeError> {
    let workdir = deps.config.locator.workdir.clone();
    git::setup_workspace(deps.sandbox.as_ref(), &workdir).await?;
    Ok(StateUpdate::new().set(&WORKDIR, workdir)?)
}

async fn clone_repository(deps: StageDeps, snapshot: StateSnapshot) -> Result<StateUpdate, NodeError> {
    let repo_url = snapshot.get(&REPO_URL)?;
    let workdir = snapshot.get(&WORKDIR)?;
    let cloned = git::clone_if_missing(deps.sandbox.as_ref(), &repo_url, &workdir).await?;
    info!(repo_url = %repo_url, workdir = %workdir, cloned, "Repository ready");
    Ok(StateUpdate::new())
}

async fn record_base_ref(deps: StageDeps, snapshot: StateSnapshot) -> Result<StateUpdate, NodeError> {
    let workdir = snapshot.get(&WORKDIR)?;
    let head = git::rev_parse_head(deps.sandbox.as_ref(), &workdir).await?;
    if head.is_empty() {
        return Err(NodeError::failed("git rev-parse HEAD printed nothing"));
    }
    Ok(StateUpdate::new().set(&BASE_REF, head)?)
}

async fn scan_source_files(deps: StageDeps, snapshot: StateSnapshot) -> Result<StateUpdate, NodeError> {
    let workdir = snapshot.get(&WORKDIR)?;
    let sandbox = deps.sandbox.as_ref();
    let paths = git::find_files(sandbox, &workdir, &deps.config.locator.extensions).await?;

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let content = git::read_file_numbered(sandbox, &path).await?;
        files.push(FileContent {
            path: repo_relative(&workdir, &path),
            content,
        });
    }
    debug!(count = files.len(), "Scanned source files");
    Ok(StateUpdate::new().set(&FILES, files)?)
}

async fn locate_code(deps: StageDeps, snapshot: StateSnapshot) -> Result<StateUpdate, NodeError> {
    let issue = snapshot.get(&STRUCTURED_ISSUE)?;
    let files = snapshot.get(&FILES)?;
    let candidates = select_candidates(&files, &issue.entities, deps.config.locator.max_candidate_files);
    if candidates.is_empty() {
        warn!(issue = issue.number, "No candidate files to show the model");
    }

    let answer = deps.ask(LOCATOR_SYSTEM, &locator_prompt(&issue, &candidates)).await?;
    let result = parse_locator_response(&answer, &deps.config.locator.workdir);
    info!(
        issue = issue.number,
        candidates = candidates.len(),
        locations = result.locations.len(),
        "Located code"
    );
    Ok(StateUpdate::new()
        .set(&LOCATIONS, result.locations)?
        .set(&EXPLANATION, result.explanation)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use patchflow_core::config::AppConfig;
    use patchflow_core::types::Intent;
    use patchflow_test_utils::{test_model_config, RecordingSandbox, ScriptedLlm};

    use crate::graph::RunStatus;

    fn file(path: &str) -> FileContent {
        FileContent {
            path: path.to_string(),
            content: "     1\tpass\n".to_string(),
        }
    }

    fn issue() -> StructuredIssue {
        StructuredIssue {
            id: 1007,
            number: 7,
            title: "Comment crash".into(),
            intent: Intent::BugFix,
            is_crash: true,
            entities: vec![Entity {
                file: Some("views.py".into()),
                function: Some("post_detail".into()),
                ..Default::default()
            }],
            summary: "Empty comments crash post_detail.".into(),
        }
    }

    fn deps(llm: Arc<ScriptedLlm>, sandbox: Arc<RecordingSandbox>) -> StageDeps {
        let config = AppConfig::parse("[model]\nmodel_id = \"m\"\n\n[locator]\nmax_candidate_files = 2\n").unwrap();
        StageDeps::new(llm, test_model_config(), sandbox, Arc::new(config))
    }

    #[test]
    fn test_select_candidates_prefers_mentioned_files() {
        let files = vec![file("a.py"), file("b.py"), file("blog/views.py"), file("c.py")];
        let entities = issue().entities;
        let picked: Vec<&str> = select_candidates(&files, &entities, 2)
            .iter()
            .map(|f| f.path.as_str())
            .collect();
        assert_eq!(picked, vec!["blog/views.py", "a.py"]);
        assert!(select_candidates(&files, &[], 0).is_empty());
    }

    #[test]
    fn test_parse_locator_response() {
        let answer = r#"Here you go:
{"locations": [{"file": "swe_agent/blog/views.py", "function": "post_detail", "line": 42}, {"file": ""}],
 "explanation": "Validate before saving."}"#;
        let result = parse_locator_response(answer, "swe_agent");
        assert_eq!(result.locations.len(), 1);
        assert_eq!(result.locations[0].file, "blog/views.py");
        assert_eq!(result.locations[0].line, Some(42));
        assert_eq!(result.explanation, "Validate before saving.");

        let empty = parse_locator_response("I could not decide.", "swe_agent");
        assert!(empty.locations.is_empty());
        assert!(empty.explanation.is_empty());
    }

    #[test]
    fn test_locator_layers() {
        let plan = build_locator_graph(&deps(Arc::new(ScriptedLlm::new()), Arc::new(RecordingSandbox::new())))
            .unwrap()
            .plan();
        assert_eq!(plan.layer_of("setup_workspace"), Some(0));
        assert_eq!(plan.layer_of("clone_repository"), Some(1));
        assert_eq!(plan.layer_of("record_base_ref"), Some(2));
        assert_eq!(plan.layer_of("scan_source_files"), Some(2));
        assert_eq!(plan.layer_of("locate_code"), Some(3));
    }

    #[tokio::test]
    async fn test_locator_end_to_end() {
        let sandbox = Arc::new(
            RecordingSandbox::new()
                .on("test -d", 1, "", "")
                .on("cd swe_agent && git rev-parse HEAD", 0, "abc123\n", "")
                .on("find swe_agent", 0, "swe_agent/setup.py\nswe_agent/blog/views.py\n", "")
                .on("nl -ba swe_agent/blog/views.py", 0, "     1\tdef post_detail(request):\n", "")
                .on("nl -ba swe_agent/setup.py", 0, "     1\tfrom setuptools import setup\n", ""),
        );
        let llm = Arc::new(ScriptedLlm::new().on(
            "code detective",
            r#"{"locations": [{"file": "blog/views.py", "function": "post_detail", "line": 1}], "explanation": "Check the form."}"#,
        ));

        let result = run_locator(
            &Executor::new(),
            &deps(llm.clone(), sandbox.clone()),
            &issue(),
            "https://github.com/acme/blog.git",
        )
        .await
        .unwrap();

        assert_eq!(result.status, RunStatus::Succeeded);
        let state = &result.terminal_state;
        assert_eq!(state.get(&WORKDIR).unwrap(), "swe_agent");
        assert_eq!(state.get(&BASE_REF).unwrap(), "abc123");
        let files = state.get(&FILES).unwrap();
        assert_eq!(files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(), vec!["blog/views.py", "setup.py"]);

        let located = locator_result(state).unwrap();
        assert_eq!(located.locations[0].function.as_deref(), Some("post_detail"));
        assert_eq!(located.explanation, "Check the form.");

        assert_eq!(sandbox.commands_starting_with("git clone").len(), 1);
        let prompt = &llm.prompts()[0];
        assert!(prompt.find("--- FILE: blog/views.py").unwrap() < prompt.find("--- FILE: setup.py").unwrap());
    }

    #[tokio::test]
    async fn test_existing_checkout_is_not_recloned() {
        let sandbox = Arc::new(RecordingSandbox::new().on("cd swe_agent && git rev-parse HEAD", 0, "abc\n", ""));
        let llm = Arc::new(ScriptedLlm::new().on("code detective", "no idea"));
        let result = run_locator(&Executor::new(), &deps(llm, sandbox.clone()), &issue(), "https://x/y.git")
            .await
            .unwrap();

        assert!(sandbox.commands_starting_with("git clone").is_empty());
        // An unparsable answer is an empty result, not a failure
        assert_eq!(result.status, RunStatus::Succeeded);
        assert!(locator_result(&result.terminal_state).unwrap().locations.is_empty());
    }

    #[tokio::test]
    async fn test_clone_failure_skips_downstream() {
        let sandbox = Arc::new(
            RecordingSandbox::new()
                .on("test -d", 1, "", "")
                .on("git clone", 128, "", "fatal: repository not found"),
        );
        let llm = Arc::new(ScriptedLlm::new());
        let result = run_locator(&Executor::new(), &deps(llm.clone(), sandbox), &issue(), "https://x/missing.git")
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::PartiallyFailed);
        assert!(result.per_node_errors["clone_repository"].to_string().contains("repository not found"));
        for node in ["record_base_ref", "scan_source_files", "locate_code"] {
            assert!(result.skipped.contains(node), "{} should be skipped", node);
        }
        assert_eq!(llm.call_count(), 0);
    }
}
