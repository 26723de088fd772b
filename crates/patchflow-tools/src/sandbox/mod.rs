pub mod gbox;
pub mod local;

use std::sync::Arc;

use patchflow_core::config::{AppConfig, SandboxKind};
use patchflow_core::error::Result;
use patchflow_core::traits::Sandbox;

pub use gbox::GboxSandbox;
pub use local::LocalSandbox;

/// Acquire the sandbox selected by `sandbox.kind`.
pub async fn acquire(config: &AppConfig) -> Result<Arc<dyn Sandbox>> {
    match config.sandbox.kind {
        SandboxKind::Local => {
            let sb = LocalSandbox::create(
                &config.sandbox_root(),
                config.sandbox.command_timeout_secs,
            )
            .await?;
            Ok(Arc::new(sb))
        }
        SandboxKind::Gbox => Ok(Arc::new(GboxSandbox::create(&config.sandbox).await?)),
    }
}
