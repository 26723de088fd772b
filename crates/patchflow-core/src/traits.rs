use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// Multi-provider streaming LLM client.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// Remote (or local) shell session that node handlers run commands in.
///
/// One handle is acquired by the driver before any graph runs and released
/// once after the last one. Handlers only ever borrow it.
pub trait Sandbox: Send + Sync + 'static {
    /// Adapter name (e.g., "local", "gbox").
    fn name(&self) -> &str;

    /// Run a shell command and capture its exit code and output.
    fn execute(&self, command: &str) -> BoxFuture<'_, Result<CommandOutput>>;

    /// Tear the session down. Must be safe to call more than once.
    fn release(&self) -> BoxFuture<'_, Result<()>>;
}

/// The host issues are read from.
pub trait IssueSource: Send + Sync + 'static {
    fn fetch_items(&self, query: &IssueQuery) -> BoxFuture<'_, Result<Vec<RawIssue>>>;
}
