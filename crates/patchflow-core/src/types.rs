use serde::{Deserialize, Serialize};

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message sent to a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
}

/// A streaming delta from the LLM.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// Stream finished.
    Stop(StopReason),

    /// Token usage report.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// Result of one shell command run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Filter for fetching issues from a source host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueQuery {
    /// Repository in `owner/name` form.
    pub repo: String,
    pub state: String,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Restrict to a single issue number.
    #[serde(default)]
    pub number: Option<u64>,
}

/// An issue exactly as the source host reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawIssue {
    pub id: u64,
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub state: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// What kind of change an issue asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    BugFix,
    FeatureRequest,
    Performance,
    Docs,
    Unknown,
}

impl Intent {
    /// Parse a model answer. Tolerates surrounding punctuation, case and
    /// spaces instead of underscores.
    pub fn parse(answer: &str) -> Self {
        let normalized: String = answer
            .trim()
            .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .to_ascii_uppercase()
            .replace([' ', '-'], "_");
        match normalized.as_str() {
            "BUG_FIX" | "BUGFIX" | "BUG" => Self::BugFix,
            "FEATURE_REQUEST" | "FEATURE" => Self::FeatureRequest,
            "PERFORMANCE" => Self::Performance,
            "DOCS" | "DOCUMENTATION" => Self::Docs,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BugFix => "BUG_FIX",
            Self::FeatureRequest => "FEATURE_REQUEST",
            Self::Performance => "PERFORMANCE",
            Self::Docs => "DOCS",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// A code entity mentioned in an issue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub line: Option<u64>,
    #[serde(default)]
    pub repro_cmd: Option<String>,
}

/// The intake stage's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredIssue {
    pub id: u64,
    pub number: u64,
    pub title: String,
    pub intent: Intent,
    pub is_crash: bool,
    pub entities: Vec<Entity>,
    pub summary: String,
}

/// A source file read from the sandbox, each line prefixed with its number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
}

/// A recommended edit location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub line: Option<u64>,
}

/// The locator stage's output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocatorResult {
    pub locations: Vec<Location>,
    pub explanation: String,
}
