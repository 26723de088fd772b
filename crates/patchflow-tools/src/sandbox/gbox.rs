use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use patchflow_core::config::SandboxConfig;
use patchflow_core::error::{PatchflowError, Result};
use patchflow_core::traits::Sandbox;
use patchflow_core::types::CommandOutput;

/// Remote Linux box from the Gbox API.
pub struct GboxSandbox {
    http: Client,
    base_url: String,
    api_key: String,
    box_id: String,
    timeout_secs: u64,
    released: AtomicBool,
}

#[derive(Deserialize)]
struct BoxInfo {
    id: String,
    #[serde(default, rename = "expiresAt")]
    expires_at: Option<String>,
}

#[derive(Deserialize, Debug)]
struct CommandResponse {
    #[serde(default = "default_exit_code", rename = "exitCode")]
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

fn default_exit_code() -> i32 { 1 }

fn unavailable(e: reqwest::Error) -> PatchflowError {
    PatchflowError::SandboxUnavailable(e.to_string())
}

fn command_payload(command: &str, timeout_secs: u64) -> serde_json::Value {
    serde_json::json!({
        "commands": command,
        "timeout": format!("{}s", timeout_secs),
    })
}

impl GboxSandbox {
    /// Create a Linux box and wait until it is ready.
    pub async fn create(config: &SandboxConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| PatchflowError::Config("sandbox.api_key is required for gbox".into()))?;
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let http = Client::new();

        info!(expires_in = %config.expires_in, "Creating Gbox Linux box");
        let resp = http
            .post(format!("{}/boxes/linux", base_url))
            .bearer_auth(&api_key)
            .json(&serde_json::json!({
                "wait": true,
                "config": { "expiresIn": config.expires_in },
            }))
            .send()
            .await
            .map_err(unavailable)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PatchflowError::SandboxUnavailable(format!(
                "box creation failed: HTTP {}: {}",
                status, body
            )));
        }

        let info: BoxInfo = resp.json().await.map_err(unavailable)?;
        info!(
            box_id = %info.id,
            expires_at = info.expires_at.as_deref().unwrap_or("unknown"),
            "Gbox box ready"
        );

        Ok(Self {
            http,
            base_url,
            api_key,
            box_id: info.id,
            timeout_secs: config.command_timeout_secs,
            released: AtomicBool::new(false),
        })
    }

    pub fn box_id(&self) -> &str {
        &self.box_id
    }
}

impl Sandbox for GboxSandbox {
    fn name(&self) -> &str {
        "gbox"
    }

    fn execute(&self, command: &str) -> BoxFuture<'_, Result<CommandOutput>> {
        let command = command.to_string();
        Box::pin(async move {
            if self.released.load(Ordering::SeqCst) {
                return Err(PatchflowError::SandboxUnavailable(format!(
                    "box {} already terminated",
                    self.box_id
                )));
            }

            debug!(box_id = %self.box_id, command = %command, "Executing remote command");

            // Give the HTTP call some slack over the server-side timeout
            let resp = self
                .http
                .post(format!("{}/boxes/{}/commands", self.base_url, self.box_id))
                .bearer_auth(&self.api_key)
                .timeout(Duration::from_secs(self.timeout_secs + 30))
                .json(&command_payload(&command, self.timeout_secs))
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        PatchflowError::SandboxTimeout {
                            command: command.clone(),
                            timeout_secs: self.timeout_secs,
                        }
                    } else {
                        unavailable(e)
                    }
                })?;

            let status = resp.status();
            if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
                return Err(PatchflowError::SandboxUnavailable(format!(
                    "box {} is gone (HTTP {})",
                    self.box_id, status
                )));
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(PatchflowError::SandboxCommand {
                    command,
                    message: format!("HTTP {}: {}", status, body),
                });
            }

            let out: CommandResponse = resp.json().await.map_err(|e| {
                PatchflowError::SandboxCommand {
                    command: command.clone(),
                    message: e.to_string(),
                }
            })?;
            debug!(exit_code = out.exit_code, "Remote command finished");

            Ok(CommandOutput {
                exit_code: out.exit_code,
                stdout: out.stdout,
                stderr: out.stderr,
            })
        })
    }

    fn release(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.released.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            info!(box_id = %self.box_id, "Terminating Gbox box");
            let resp = self
                .http
                .post(format!("{}/boxes/{}/terminate", self.base_url, self.box_id))
                .bearer_auth(&self.api_key)
                .json(&serde_json::json!({ "wait": true }))
                .send()
                .await
                .map_err(unavailable)?;
            if !resp.status().is_success() {
                warn!(box_id = %self.box_id, status = %resp.status(), "Box termination failed");
                return Err(PatchflowError::SandboxUnavailable(format!(
                    "terminate returned HTTP {}",
                    resp.status()
                )));
            }
            Ok(())
        })
    }
}
