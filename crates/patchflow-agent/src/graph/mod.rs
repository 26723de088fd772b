//! Workflow engine: a validated DAG of nodes over a shared, typed state record.
//!
//! Nodes declare the keys they require and produce. `Graph::build` infers
//! data edges from those declarations, rejects cycles and unsatisfiable
//! requirements, and `Graph::plan` groups the nodes into topological layers.
//! The `Executor` runs each layer concurrently against an immutable snapshot
//! and merges the layer's updates once all of its nodes are done. The
//! `RetryCoordinator` reruns a whole graph, feeding the previous attempt's
//! diagnostics into the next one.

pub mod builder;
pub mod edge;
pub mod error;
pub mod executor;
pub mod node;
pub mod plan;
pub mod retry;
pub mod state;

pub use builder::Graph;
pub use edge::Edge;
pub use error::{NodeError, StateError, ValidationError};
pub use executor::{Executor, NodeState, RunResult, RunStatus};
pub use node::{handler_fn, FnHandler, NodeHandler, NodeSpec};
pub use plan::ExecutionPlan;
pub use retry::{PreviousFailure, RetryContext, RetryCoordinator, RetryOutcome, RetryPolicy, RETRY_CONTEXT};
pub use state::{StateKey, StateSnapshot, StateStore, StateUpdate, ValueKind};
