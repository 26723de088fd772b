use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{info, warn};

use patchflow_core::traits::Sandbox;

/// Scoped ownership of the one sandbox handle a driver run uses.
///
/// The body only borrows the handle; release happens exactly once after it
/// finishes, whether it returned normally, returned an error or panicked.
pub struct SandboxSession;

impl SandboxSession {
    pub async fn scoped<F, Fut, T>(sandbox: Arc<dyn Sandbox>, f: F) -> T
    where
        F: FnOnce(Arc<dyn Sandbox>) -> Fut,
        Fut: Future<Output = T>,
    {
        info!(sandbox = sandbox.name(), "Sandbox session opened");
        let outcome = AssertUnwindSafe(f(sandbox.clone())).catch_unwind().await;

        if let Err(e) = sandbox.release().await {
            warn!(sandbox = sandbox.name(), error = %e, "Sandbox release failed");
        } else {
            info!(sandbox = sandbox.name(), "Sandbox session released");
        }

        match outcome {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchflow_core::error::PatchflowError;
    use patchflow_test_utils::RecordingSandbox;

    #[tokio::test]
    async fn test_releases_after_success() {
        let sb = Arc::new(RecordingSandbox::new());
        let out = SandboxSession::scoped(sb.clone(), |s| async move {
            s.execute("echo hi").await.map(|o| o.exit_code)
        })
        .await;
        assert_eq!(out.unwrap(), 0);
        assert_eq!(sb.release_count(), 1);
        assert_eq!(sb.commands(), vec!["echo hi"]);
    }

    #[tokio::test]
    async fn test_releases_after_error() {
        let sb = Arc::new(RecordingSandbox::new());
        let out: Result<(), PatchflowError> = SandboxSession::scoped(sb.clone(), |_| async {
            Err(PatchflowError::Config("boom".into()))
        })
        .await;
        assert!(out.is_err());
        assert_eq!(sb.release_count(), 1);
    }

    #[tokio::test]
    async fn test_releases_after_panic() {
        let sb = Arc::new(RecordingSandbox::new());
        let inner = sb.clone();
        let handle = tokio::spawn(async move {
            SandboxSession::scoped(inner, |_| async {
                panic!("handler blew up");
            })
            .await
        });
        assert!(handle.await.is_err());
        assert_eq!(sb.release_count(), 1);
    }
}
