use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use super::error::NodeError;
use super::state::{StateSnapshot, StateUpdate};

/// The work a node performs: snapshot in, partial update out.
pub trait NodeHandler: Send + Sync + 'static {
    fn run(&self, snapshot: StateSnapshot) -> BoxFuture<'_, Result<StateUpdate, NodeError>>;
}

/// Adapts an async closure into a [`NodeHandler`].
pub struct FnHandler<F>(F);

impl<F, Fut> NodeHandler for FnHandler<F>
where
    F: Fn(StateSnapshot) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StateUpdate, NodeError>> + Send + 'static,
{
    fn run(&self, snapshot: StateSnapshot) -> BoxFuture<'_, Result<StateUpdate, NodeError>> {
        Box::pin((self.0)(snapshot))
    }
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(StateSnapshot) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StateUpdate, NodeError>> + Send + 'static,
{
    FnHandler(f)
}

/// A named unit of work with declared input and output keys.
#[derive(Clone)]
pub struct NodeSpec {
    /// Unique within a graph.
    pub name: String,
    /// Keys that must be present in the snapshot before the node may run.
    pub requires: BTreeSet<String>,
    /// Keys this node writes once.
    pub produces: BTreeSet<String>,
    /// Keys this node may overwrite.
    pub updates: BTreeSet<String>,
    /// Overrides the executor's default node timeout.
    pub timeout: Option<Duration>,
    handler: Arc<dyn NodeHandler>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, handler: impl NodeHandler) -> Self {
        Self {
            name: name.into(),
            requires: BTreeSet::new(),
            produces: BTreeSet::new(),
            updates: BTreeSet::new(),
            timeout: None,
            handler: Arc::new(handler),
        }
    }

    /// Shorthand for `NodeSpec::new(name, handler_fn(f))`.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StateSnapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StateUpdate, NodeError>> + Send + 'static,
    {
        Self::new(name, handler_fn(f))
    }

    pub fn requires(mut self, key: impl AsRef<str>) -> Self {
        self.requires.insert(key.as_ref().to_string());
        self
    }

    pub fn produces(mut self, key: impl AsRef<str>) -> Self {
        self.produces.insert(key.as_ref().to_string());
        self
    }

    pub fn updates(mut self, key: impl AsRef<str>) -> Self {
        self.updates.insert(key.as_ref().to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn handler(&self) -> Arc<dyn NodeHandler> {
        self.handler.clone()
    }

    /// Every key this node may write.
    pub fn writes(&self) -> impl Iterator<Item = &String> {
        self.produces.union(&self.updates)
    }
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("requires", &self.requires)
            .field("produces", &self.produces)
            .field("updates", &self.updates)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::state::{StateKey, StateStore};

    const IN: StateKey<String> = StateKey::new("in");
    const OUT: StateKey<usize> = StateKey::new("out");

    #[test]
    fn test_node_builder() {
        let node = NodeSpec::from_fn("len", |_s| async { Ok(StateUpdate::new()) })
            .requires(IN)
            .produces(&OUT)
            .updates("counter")
            .with_timeout(Duration::from_secs(5));

        assert_eq!(node.name, "len");
        assert!(node.requires.contains("in"));
        assert!(node.produces.contains("out"));
        assert_eq!(node.writes().count(), 2);
        assert_eq!(node.timeout, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_fn_handler_runs() {
        let node = NodeSpec::from_fn("len", |s: StateSnapshot| async move {
            let text = s.get(&IN)?;
            Ok(StateUpdate::new().set(&OUT, text.len())?)
        });
        let snap = StateStore::new()
            .seed(&IN, &"hello".to_string())
            .unwrap()
            .snapshot();
        let update = node.handler().run(snap).await.unwrap();
        assert_eq!(update.keys().collect::<Vec<_>>(), vec!["out"]);
    }
}
