pub mod providers;
pub mod retry;
pub mod streaming;

use futures::StreamExt;
use tracing::debug;

use patchflow_core::config::{AppConfig, ModelConfig};
use patchflow_core::error::{PatchflowError, Result};
use patchflow_core::traits::LlmClient;
use patchflow_core::types::{ChatMessage, StreamDelta};

pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create an LLM client based on the provider name.
///
/// Every supported provider speaks the OpenAI chat-completions protocol.
pub fn create_client(config: &ModelConfig) -> Result<Box<dyn LlmClient>> {
    let Some(preset) = providers::presets::get_preset(&config.provider) else {
        return Err(PatchflowError::UnsupportedProvider(config.provider.clone()));
    };
    if preset.needs_api_key && config.api_key.as_deref().unwrap_or("").is_empty() {
        return Err(PatchflowError::Config(format!(
            "provider '{}' requires model.api_key",
            config.provider
        )));
    }
    Ok(Box::new(OpenAiClient::new()))
}

/// Build the client the stages use: primary model wrapped in retry and fallbacks.
///
/// Returns the resolved primary config alongside, with preset defaults applied.
pub fn build_client(app: &AppConfig) -> Result<(ModelConfig, Box<dyn LlmClient>)> {
    let mut primary_config = app.model.clone();
    providers::presets::apply_preset_defaults(&mut primary_config);
    let primary = create_client(&primary_config)?;

    let mut fallbacks = Vec::new();
    for fb in &app.fallback_models {
        let mut fb = fb.clone();
        providers::presets::apply_preset_defaults(&mut fb);
        let client = create_client(&fb)?;
        fallbacks.push((fb, client));
    }

    let Some(retry_config) = primary_config.retry.clone() else {
        if fallbacks.is_empty() {
            return Ok((primary_config, primary));
        }
        let client = RetryingClient::new(primary, fallbacks, Default::default());
        return Ok((primary_config, Box::new(client)));
    };

    let client = RetryingClient::new(primary, fallbacks, retry_config);
    Ok((primary_config, Box::new(client)))
}

/// Send a system + user prompt and collect the streamed text into one string.
pub async fn complete_text(
    llm: &dyn LlmClient,
    config: &ModelConfig,
    system: &str,
    user: &str,
) -> Result<String> {
    let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
    let mut stream = llm.chat_stream(config, messages).await?;

    let mut text = String::new();
    while let Some(delta) = stream.next().await {
        match delta? {
            StreamDelta::TextDelta(t) => text.push_str(&t),
            StreamDelta::Usage {
                input_tokens,
                output_tokens,
            } => {
                debug!(input_tokens, output_tokens, "LLM usage");
            }
            StreamDelta::Stop(_) => {}
        }
    }
    Ok(text)
}
