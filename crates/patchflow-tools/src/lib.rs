pub mod git;
pub mod github;
pub mod sandbox;
pub mod session;

pub use github::GithubIssueSource;
pub use sandbox::{acquire, GboxSandbox, LocalSandbox};
pub use session::SandboxSession;
