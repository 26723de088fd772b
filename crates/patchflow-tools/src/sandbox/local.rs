use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use patchflow_core::error::{PatchflowError, Result};
use patchflow_core::traits::Sandbox;
use patchflow_core::types::CommandOutput;

/// Shell sandbox on the local machine.
///
/// Every session gets its own directory under the configured root; commands
/// run there with `bash -c`. Releasing the session removes the directory.
pub struct LocalSandbox {
    dir: PathBuf,
    timeout_secs: u64,
    released: AtomicBool,
}

impl LocalSandbox {
    /// Create a fresh session directory under `root`.
    pub async fn create(root: &Path, timeout_secs: u64) -> Result<Self> {
        let dir = root.join(format!("session-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        info!(dir = %dir.display(), "Local sandbox created");
        Ok(Self {
            dir,
            timeout_secs,
            released: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Sandbox for LocalSandbox {
    fn name(&self) -> &str {
        "local"
    }

    fn execute(&self, command: &str) -> BoxFuture<'_, Result<CommandOutput>> {
        let command = command.to_string();
        Box::pin(async move {
            if self.released.load(Ordering::SeqCst) {
                return Err(PatchflowError::SandboxUnavailable(
                    "local session already released".into(),
                ));
            }

            debug!(command = %command, "Executing sandbox command");

            let timeout = Duration::from_secs(self.timeout_secs);
            let result = tokio::time::timeout(timeout, async {
                tokio::process::Command::new("bash")
                    .arg("-c")
                    .arg(&command)
                    .current_dir(&self.dir)
                    .kill_on_drop(true)
                    .output()
                    .await
            })
            .await;

            match result {
                Ok(Ok(output)) => Ok(CommandOutput {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                }),
                Ok(Err(e)) => Err(PatchflowError::SandboxCommand {
                    command,
                    message: e.to_string(),
                }),
                Err(_) => Err(PatchflowError::SandboxTimeout {
                    command,
                    timeout_secs: self.timeout_secs,
                }),
            }
        })
    }

    fn release(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.released.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            match tokio::fs::remove_dir_all(&self.dir).await {
                Ok(()) => {
                    info!(dir = %self.dir.display(), "Local sandbox released");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => {
                    warn!(dir = %self.dir.display(), error = %e, "Failed to remove sandbox dir");
                    Err(e.into())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_captures_output() {
        let root = tempfile::tempdir().unwrap();
        let sb = LocalSandbox::create(root.path(), 10).await.unwrap();
        let out = sb.execute("echo hi; echo oops >&2; exit 3").await.unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_commands_run_in_session_dir() {
        let root = tempfile::tempdir().unwrap();
        let sb = LocalSandbox::create(root.path(), 10).await.unwrap();
        sb.execute("mkdir -p work && echo x > work/f.txt").await.unwrap();
        assert!(sb.dir().join("work/f.txt").exists());
    }

    #[tokio::test]
    async fn test_timeout() {
        let root = tempfile::tempdir().unwrap();
        let sb = LocalSandbox::create(root.path(), 1).await.unwrap();
        let err = sb.execute("sleep 5").await.unwrap_err();
        assert!(matches!(err, PatchflowError::SandboxTimeout { timeout_secs: 1, .. }));
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_final() {
        let root = tempfile::tempdir().unwrap();
        let sb = LocalSandbox::create(root.path(), 10).await.unwrap();
        let dir = sb.dir().to_path_buf();
        sb.release().await.unwrap();
        sb.release().await.unwrap();
        assert!(!dir.exists());
        let err = sb.execute("true").await.unwrap_err();
        assert!(matches!(err, PatchflowError::SandboxUnavailable(_)));
    }
}
