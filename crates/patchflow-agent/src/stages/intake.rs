//! Intake: turn a raw issue into a [`StructuredIssue`].
//!
//! `clean_text` fans out to four independent model calls which join again
//! in `compose_structured`.

use tracing::{debug, info};

use patchflow_core::types::{Entity, Intent, RawIssue, StructuredIssue};

use super::keys::*;
use super::{extract_json, stage_node, StageDeps, StageError};
use crate::graph::{Executor, Graph, NodeError, NodeSpec, RunResult, StateSnapshot, StateStore, StateUpdate, ValidationError};

const CLASSIFIER_PROMPT: &str = "You are an issue classifier. \
Only respond with one of: BUG_FIX, FEATURE_REQUEST, PERFORMANCE, or DOCS.";

const CRASH_PROMPT: &str = "You are a crash detector. \
Only respond with 'yes' if the issue describes a crash or unhandled exception, otherwise respond with 'no'.";

const EXTRACTOR_PROMPT: &str = "You are an entity extractor. Output only a strict JSON array, no extra text.";

const SUMMARIZER_PROMPT: &str = "You are a software engineering assistant. \
Summarize the core issue in one clear sentence.";

pub fn build_intake_graph(deps: &StageDeps) -> Result<Graph, ValidationError> {
    Graph::build(
        vec![
            NodeSpec::from_fn("clean_text", clean_text)
                .requires(INPUT_ISSUE)
                .produces(CLEANED_TEXT),
            stage_node("classify_intent", deps, classify_intent)
                .requires(CLEANED_TEXT)
                .produces(INTENT),
            stage_node("detect_crash", deps, detect_crash)
                .requires(CLEANED_TEXT)
                .produces(IS_CRASH),
            stage_node("extract_entities", deps, extract_entities)
                .requires(CLEANED_TEXT)
                .produces(ENTITIES),
            stage_node("summarize_issue", deps, summarize_issue)
                .requires(CLEANED_TEXT)
                .produces(SUMMARY),
            NodeSpec::from_fn("compose_structured", compose_structured)
                .requires(INPUT_ISSUE)
                .requires(INTENT)
                .requires(IS_CRASH)
                .requires(ENTITIES)
                .requires(SUMMARY)
                .produces(STRUCTURED_ISSUE),
        ],
        vec![],
        [INPUT_ISSUE.name()],
    )
}

pub async fn run_intake(executor: &Executor, deps: &StageDeps, issue: &RawIssue) -> Result<RunResult, StageError> {
    let graph = build_intake_graph(deps)?;
    let state = StateStore::new().seed(&INPUT_ISSUE, issue)?;
    info!(issue = issue.number, title = %issue.title, "intake_started");
    Ok(executor.run_graph(&graph, state).await)
}

/// Drop fenced code blocks and blank lines. An unterminated fence is kept.
pub fn clean_issue_text(text: &str) -> String {
    let mut kept = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let Some(end) = after.find("```") else {
            break;
        };
        kept.push_str(&rest[..start]);
        rest = &after[end + 3..];
    }
    kept.push_str(rest);

    kept.lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Parse the extractor's answer: the outermost JSON array, nulls allowed.
pub fn parse_entities(answer: &str) -> Result<Vec<Entity>, NodeError> {
    let json = extract_json(answer, '[', ']')
        .ok_or_else(|| NodeError::failed(format!("no JSON array in extractor response: {:?}", answer)))?;
    serde_json::from_str(json).map_err(|e| NodeError::failed(format!("invalid entity JSON: {}", e)))
}

fn extraction_prompt(cleaned: &str) -> String {
    format!(
        "Please extract the following fields as a JSON array:\n\
         - file: filename\n\
         - function: function or method name\n\
         - line: line number (optional)\n\
         - repro_cmd: reproduction command (optional)\n\
         If a field is missing, set its value to null.\n\n\
         ```{}```",
        cleaned
    )
}

async fn clean_text(snapshot: StateSnapshot) -> Result<StateUpdate, NodeError> {
    let issue = snapshot.get(&INPUT_ISSUE)?;
    // Title stands in for an empty body
    let source = if issue.body.trim().is_empty() {
        issue.title.as_str()
    } else {
        issue.body.as_str()
    };
    Ok(StateUpdate::new().set(&CLEANED_TEXT, clean_issue_text(source))?)
}

async fn classify_intent(deps: StageDeps, snapshot: StateSnapshot) -> Result<StateUpdate, NodeError> {
    let text = snapshot.get(&CLEANED_TEXT)?;
    let answer = deps.ask(CLASSIFIER_PROMPT, &text).await?;
    let intent = Intent::parse(&answer);
    debug!(%intent, answer = %answer, "Classified issue");
    Ok(StateUpdate::new().set(&INTENT, intent)?)
}

async fn detect_crash(deps: StageDeps, snapshot: StateSnapshot) -> Result<StateUpdate, NodeError> {
    let text = snapshot.get(&CLEANED_TEXT)?;
    let answer = deps.ask(CRASH_PROMPT, &text).await?;
    let is_crash = answer.to_lowercase().starts_with('y');
    Ok(StateUpdate::new().set(&IS_CRASH, is_crash)?)
}

async fn extract_entities(deps: StageDeps, snapshot: StateSnapshot) -> Result<StateUpdate, NodeError> {
    let text = snapshot.get(&CLEANED_TEXT)?;
    let answer = deps.ask(EXTRACTOR_PROMPT, &extraction_prompt(&text)).await?;
    let entities = parse_entities(&answer)?;
    debug!(count = entities.len(), "Extracted entities");
    Ok(StateUpdate::new().set(&ENTITIES, entities)?)
}

async fn summarize_issue(deps: StageDeps, snapshot: StateSnapshot) -> Result<StateUpdate, NodeError> {
    let text = snapshot.get(&CLEANED_TEXT)?;
    let prompt = format!(
        "Please provide a single clear sentence summarizing the core problem and how to fix it, \
         or how to enhance it described below:\n\n{}",
        text
    );
    let summary = deps.ask(SUMMARIZER_PROMPT, &prompt).await?;
    Ok(StateUpdate::new().set(&SUMMARY, summary)?)
}

async fn compose_structured(snapshot: StateSnapshot) -> Result<StateUpdate, NodeError> {
    let issue = snapshot.get(&INPUT_ISSUE)?;
    let structured = StructuredIssue {
        id: issue.id,
        number: issue.number,
        title: issue.title,
        intent: snapshot.get(&INTENT)?,
        is_crash: snapshot.get(&IS_CRASH)?,
        entities: snapshot.get(&ENTITIES)?,
        summary: snapshot.get(&SUMMARY)?,
    };
    Ok(StateUpdate::new().set(&STRUCTURED_ISSUE, structured)?)
}
