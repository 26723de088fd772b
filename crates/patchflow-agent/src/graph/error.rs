use thiserror::Error;

use patchflow_core::error::PatchflowError;

use super::state::ValueKind;

/// Construction-time graph errors. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("duplicate node name: '{0}'")]
    DuplicateNode(String),

    #[error("edge {from} -> {to} references unknown node '{missing}'")]
    UnknownNode {
        from: String,
        to: String,
        missing: String,
    },

    #[error("key '{key}' has two writers: '{first}' and '{second}'")]
    DuplicateProducer {
        key: String,
        first: String,
        second: String,
    },

    #[error("key '{key}' is seeded by the caller but produced by node '{node}'")]
    SeededKeyProduced { key: String, node: String },

    #[error("cycle detected among nodes: {}", .nodes.join(", "))]
    Cycle { nodes: Vec<String> },

    #[error("node '{node}' requires key '{key}' which neither a predecessor nor the initial state provides")]
    UnsatisfiedDependency { node: String, key: String },
}

/// A rejected read or write against the state record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("key '{0}' is already set and may not be overwritten")]
    AlreadySet(String),

    #[error("key '{key}' holds {expected} values, got {actual}")]
    KindMismatch {
        key: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("write to undeclared key '{0}'")]
    UndeclaredWrite(String),

    #[error("missing key '{0}'")]
    Missing(String),

    #[error("failed to decode key '{key}': {message}")]
    Decode { key: String, message: String },

    #[error("failed to encode key '{key}': {message}")]
    Encode { key: String, message: String },
}

/// Why a single node did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("{0}")]
    Failed(String),

    /// Stops the run after the current layer.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl NodeError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl From<PatchflowError> for NodeError {
    fn from(e: PatchflowError) -> Self {
        match e {
            // Losing the sandbox means no later node can do anything useful
            PatchflowError::SandboxUnavailable(_) => Self::Fatal(e.to_string()),
            other => Self::Failed(other.to_string()),
        }
    }
}
