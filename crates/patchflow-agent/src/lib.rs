pub mod graph;
pub mod stages;

pub use graph::{
    Edge, ExecutionPlan, Executor, Graph, NodeError, NodeSpec, RetryCoordinator, RetryOutcome, RetryPolicy, RunResult,
    RunStatus, StateKey, StateSnapshot, StateStore, StateUpdate, ValidationError,
};
pub use stages::{StageDeps, StageError};
