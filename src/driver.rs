//! Runs every fetched issue through intake, locator and patcher.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use patchflow_agent::graph::{RetryOutcome, RunResult, RunStatus};
use patchflow_agent::stages::keys::{BRANCH, FILES, STRUCTURED_ISSUE, WORKDIR};
use patchflow_agent::stages::{intake, locator, patcher};
use patchflow_agent::{Executor, StageDeps, StageError};
use patchflow_core::error::PatchflowError;
use patchflow_core::traits::IssueSource;
use patchflow_core::types::{IssueQuery, RawIssue};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Host(#[from] PatchflowError),

    #[error("interrupted")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IssueOutcome {
    Applied {
        branch: String,
        workdir: String,
        attempts: u32,
    },
    Failed {
        stage: &'static str,
        reason: String,
        /// The run was aborted; later issues are not attempted.
        aborted: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssueReport {
    pub number: u64,
    pub title: String,
    pub outcome: IssueOutcome,
}

impl IssueReport {
    fn failed(issue: &RawIssue, stage: &'static str, run: &RunResult) -> Self {
        Self {
            number: issue.number,
            title: issue.title.clone(),
            outcome: IssueOutcome::Failed {
                stage,
                reason: run.error_summary(),
                aborted: run.status == RunStatus::Aborted,
            },
        }
    }

    pub fn applied(&self) -> bool {
        matches!(self.outcome, IssueOutcome::Applied { .. })
    }

    fn aborted(&self) -> bool {
        matches!(self.outcome, IssueOutcome::Failed { aborted: true, .. })
    }
}

impl fmt::Display for IssueReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            IssueOutcome::Applied {
                branch,
                workdir,
                attempts,
            } => write!(
                f,
                "#{} {}: patch applied on branch {} in {} (attempt {})",
                self.number, self.title, branch, workdir, attempts
            ),
            IssueOutcome::Failed { stage, reason, .. } => {
                write!(f, "#{} {}: {} failed", self.number, self.title, stage)?;
                if !reason.is_empty() {
                    write!(f, "\n{}", reason)?;
                }
                Ok(())
            }
        }
    }
}

/// Exit status for a finished run: 0 iff every processed issue applied.
pub fn exit_code(reports: &[IssueReport]) -> u8 {
    if reports.iter().all(IssueReport::applied) {
        0
    } else {
        1
    }
}

pub fn repo_url(repo: &str) -> String {
    format!("https://github.com/{}.git", repo.trim_matches('/'))
}

pub struct Driver {
    deps: StageDeps,
    issues: Arc<dyn IssueSource>,
    executor: Executor,
}

impl Driver {
    pub fn new(deps: StageDeps, issues: Arc<dyn IssueSource>, executor: Executor) -> Self {
        Self {
            deps,
            issues,
            executor,
        }
    }

    pub async fn run(&self, repo: &str, only: Option<u64>) -> Result<Vec<IssueReport>, DriverError> {
        let github = &self.deps.config.github;
        let query = IssueQuery {
            repo: repo.to_string(),
            state: github.state.clone(),
            labels: github.labels.clone(),
            number: only,
        };
        let issues = self.issues.fetch_items(&query).await?;
        info!(repo, count = issues.len(), "Fetched issues");

        let url = repo_url(repo);
        let mut reports = Vec::with_capacity(issues.len());
        for issue in &issues {
            if self.executor.cancel_token().is_cancelled() {
                return Err(DriverError::Cancelled);
            }
            let report = self.process_issue(&url, issue).await?;
            println!("{}\n", report);
            if self.executor.cancel_token().is_cancelled() {
                warn!(issue = issue.number, "Interrupted, skipping remaining issues");
                return Err(DriverError::Cancelled);
            }
            let aborted = report.aborted();
            reports.push(report);
            if aborted {
                warn!(issue = issue.number, "Run aborted, skipping remaining issues");
                break;
            }
        }
        Ok(reports)
    }

    async fn process_issue(&self, repo_url: &str, issue: &RawIssue) -> Result<IssueReport, DriverError> {
        info!(issue = issue.number, title = %issue.title, "Processing issue");

        let intake_run = intake::run_intake(&self.executor, &self.deps, issue).await?;
        print_stage("intake", &intake_run);
        let Ok(structured) = intake_run.terminal_state.get(&STRUCTURED_ISSUE) else {
            return Ok(IssueReport::failed(issue, "intake", &intake_run));
        };

        let locator_run = locator::run_locator(&self.executor, &self.deps, &structured, repo_url).await?;
        print_stage("locator", &locator_run);
        let initial = match patcher::patcher_state(&locator_run.terminal_state) {
            Ok(state) if locator_run.succeeded() => state,
            _ => return Ok(IssueReport::failed(issue, "locator", &locator_run)),
        };

        let outcome = patcher::run_patcher(&self.executor, &self.deps, &initial).await?;
        print_stage("patcher", &outcome.result);
        Ok(patcher_report(issue, &outcome))
    }
}

fn patcher_report(issue: &RawIssue, outcome: &RetryOutcome) -> IssueReport {
    let state = &outcome.result.terminal_state;
    let outcome_kind = match (outcome.succeeded(), state.get(&BRANCH), state.get(&WORKDIR)) {
        (true, Ok(branch), Ok(workdir)) => IssueOutcome::Applied {
            branch,
            workdir,
            attempts: outcome.attempts,
        },
        _ => {
            let mut reason = outcome
                .last_failure()
                .map(|f| f.diagnostic_text())
                .unwrap_or_default();
            if !reason.is_empty() {
                reason.push('\n');
            }
            reason.push_str(&format!("retries exhausted after {} attempt(s)", outcome.attempts));
            IssueOutcome::Failed {
                stage: "patcher",
                reason,
                aborted: outcome.history.last().is_some_and(|f| f.status == RunStatus::Aborted),
            }
        }
    };
    IssueReport {
        number: issue.number,
        title: issue.title.clone(),
        outcome: outcome_kind,
    }
}

/// Print a stage's terminal state. File contents are reduced to their paths.
fn print_stage(stage: &str, run: &RunResult) {
    let mut state = run.terminal_state.to_json();
    if let Some(files) = state.get_mut(FILES.name()) {
        let paths: Vec<Value> = files
            .as_array()
            .map(|arr| arr.iter().filter_map(|f| f.get("path").cloned()).collect())
            .unwrap_or_default();
        *files = Value::Array(paths);
    }
    println!("== {} ({}, {} ms) ==", stage, run.status, run.elapsed_ms);
    println!("{}", serde_json::to_string_pretty(&state).unwrap_or_default());
    if !run.per_node_errors.is_empty() {
        println!("errors:\n{}", run.error_summary());
    }
}
