//! State keys shared by the stage graphs.

use patchflow_core::types::{Entity, FileContent, Intent, Location, RawIssue, StructuredIssue};

use crate::graph::StateKey;

// Intake
pub const INPUT_ISSUE: StateKey<RawIssue> = StateKey::new("input_issue");
pub const CLEANED_TEXT: StateKey<String> = StateKey::new("cleaned_text");
pub const INTENT: StateKey<Intent> = StateKey::new("intent");
pub const IS_CRASH: StateKey<bool> = StateKey::new("is_crash");
pub const ENTITIES: StateKey<Vec<Entity>> = StateKey::new("entities");
pub const SUMMARY: StateKey<String> = StateKey::new("summary");
pub const STRUCTURED_ISSUE: StateKey<StructuredIssue> = StateKey::new("structured_issue");

// Locator
pub const REPO_URL: StateKey<String> = StateKey::new("repo_url");
pub const WORKDIR: StateKey<String> = StateKey::new("workdir");
pub const BASE_REF: StateKey<String> = StateKey::new("base_ref");
/// Paths are relative to the repository root.
pub const FILES: StateKey<Vec<FileContent>> = StateKey::new("files");
pub const LOCATIONS: StateKey<Vec<Location>> = StateKey::new("locations");
pub const EXPLANATION: StateKey<String> = StateKey::new("explanation");

// Patcher
pub const PATCH: StateKey<String> = StateKey::new("patch");
pub const BRANCH: StateKey<String> = StateKey::new("branch");
pub const APPLIED_OK: StateKey<bool> = StateKey::new("applied_ok");
pub const APPLY_STDOUT: StateKey<String> = StateKey::new("apply_stdout");
pub const APPLY_STDERR: StateKey<String> = StateKey::new("apply_stderr");
