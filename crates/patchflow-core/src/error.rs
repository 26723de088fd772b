use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchflowError {
    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Sandbox errors
    #[error("Sandbox command failed: {command}: {message}")]
    SandboxCommand { command: String, message: String },

    #[error("Sandbox command timed out after {timeout_secs}s: {command}")]
    SandboxTimeout { command: String, timeout_secs: u64 },

    /// The session handle is gone (terminated, expired or unreachable).
    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    // Source host errors
    #[error("Source host error: {0}")]
    SourceHost(String),

    #[error("Git error: {operation}: {message}")]
    Git { operation: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PatchflowError>;
