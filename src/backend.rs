//! Model backends: the capability that actually talks to an LLM.
//!
//! The scraper only needs one thing from a backend: given a model, its
//! parameters and a message sequence, return the raw output text with the
//! token counts the provider billed, and say whether generation stopped
//! early. [`ModelBackend`] captures exactly that, so tests and alternative
//! transports can slot in without touching the orchestration logic.
//!
//! [`ProviderBackend`] is the production implementation on top of
//! `edgequake-llm`, which already speaks OpenAI, Anthropic, Gemini, Azure,
//! Mistral, Ollama and other OpenAI-compatible endpoints.

use crate::error::{BackendError, ScrapeError};
use crate::instructions::{ImageRef, Message, Role};
use crate::pricing::ModelSpec;
use crate::response::FinishReason;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// What a backend returns for one successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReply {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub finish: FinishReason,
}

/// A text or vision-capable LLM backend.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Whether image attachments are accepted.
    fn supports_vision(&self) -> bool {
        true
    }

    /// Send `messages` to `model` and return the raw reply.
    async fn send(&self, model: &ModelSpec, messages: &[Message])
        -> Result<BackendReply, BackendError>;
}

/// [`ModelBackend`] over `edgequake-llm` providers, one per model name.
pub struct ProviderBackend {
    name: String,
    providers: HashMap<String, Arc<dyn LLMProvider>>,
}

impl std::fmt::Debug for ProviderBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderBackend")
            .field("name", &self.name)
            .field("models", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderBackend {
    /// An empty backend; add providers with [`ProviderBackend::with_provider`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            providers: HashMap::new(),
        }
    }

    /// Route calls for `model` to a pre-built provider.
    pub fn with_provider(mut self, model: impl Into<String>, provider: Arc<dyn LLMProvider>) -> Self {
        self.providers.insert(model.into(), provider);
        self
    }

    /// Resolve one provider per model, from most-specific to least-specific:
    ///
    /// 1. **Named provider** (`provider_name`), e.g. `"openai"`, `"ollama"`;
    ///    the factory reads the matching API key from the environment.
    /// 2. **`EDGEQUAKE_LLM_PROVIDER`**: provider chosen by the execution
    ///    environment (Makefile, CI).
    /// 3. **`OPENAI_API_KEY`** present: OpenAI.
    /// 4. **Full auto-detection** (`ProviderFactory::from_env`), which is
    ///    bound to its own default model and therefore only used when a
    ///    single model is configured.
    pub fn resolve(provider_name: Option<&str>, models: &[ModelSpec]) -> Result<Self, ScrapeError> {
        let explicit = provider_name
            .map(str::to_string)
            .or_else(|| non_empty_env("EDGEQUAKE_LLM_PROVIDER"))
            .or_else(|| non_empty_env("OPENAI_API_KEY").map(|_| "openai".to_string()));

        let mut backend = Self::new(explicit.clone().unwrap_or_else(|| "auto".into()));
        match explicit {
            Some(provider) => {
                for spec in models {
                    let p = ProviderFactory::create_llm_provider(&provider, &spec.name).map_err(|e| {
                        ScrapeError::InvalidConfig(format!(
                            "LLM provider '{provider}' is not configured for '{}': {e}",
                            spec.name
                        ))
                    })?;
                    backend.providers.insert(spec.name.clone(), p);
                }
            }
            None => {
                if models.len() != 1 {
                    return Err(ScrapeError::InvalidConfig(
                        "several models configured but no provider named; set --provider or \
                         EDGEQUAKE_LLM_PROVIDER"
                            .into(),
                    ));
                }
                let (llm, _embedding) = ProviderFactory::from_env().map_err(|e| {
                    ScrapeError::InvalidConfig(format!(
                        "No LLM provider could be auto-detected from environment.\n\
                         Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                         Error: {e}"
                    ))
                })?;
                backend.providers.insert(models[0].name.clone(), llm);
            }
        }
        Ok(backend)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[async_trait]
impl ModelBackend for ProviderBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        model: &ModelSpec,
        messages: &[Message],
    ) -> Result<BackendReply, BackendError> {
        let provider = self.providers.get(&model.name).ok_or_else(|| {
            BackendError::Transport(format!("no provider registered for model '{}'", model.name))
        })?;

        let chat: Vec<ChatMessage> = messages.iter().map(to_chat_message).collect();
        let options = build_options(model);

        let response = provider
            .chat(&chat, Some(&options))
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        debug!(
            "{}: {} prompt tokens, {} completion tokens, finish={:?}",
            model.name, response.prompt_tokens, response.completion_tokens, response.finish_reason
        );

        Ok(BackendReply {
            content: response.content,
            prompt_tokens: response.prompt_tokens as u64,
            completion_tokens: response.completion_tokens as u64,
            finish: FinishReason::from_provider(response.finish_reason.as_deref()),
        })
    }
}

fn to_chat_message(message: &Message) -> ChatMessage {
    match message.role {
        Role::System => ChatMessage::system(message.content.as_str()),
        Role::User if message.images.is_empty() => ChatMessage::user(message.content.as_str()),
        Role::User => ChatMessage::user_with_images(
            message.content.as_str(),
            message.images.iter().map(to_image_data).collect(),
        ),
    }
}

/// URLs pass straight through to the provider; inline screenshots go as
/// base64 with high detail.
fn to_image_data(image: &ImageRef) -> ImageData {
    match image {
        ImageRef::Url(url) => ImageData::from_url(url.clone()),
        ImageRef::Inline { data, mime_type } => {
            ImageData::new(data.clone(), mime_type.clone()).with_detail("high")
        }
    }
}

/// Build `CompletionOptions` from the model parameters.
fn build_options(model: &ModelSpec) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(model.params.temperature),
        max_tokens: model.params.max_output_tokens,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelParams;

    #[test]
    fn build_options_defaults() {
        let spec = ModelSpec::named("gpt-4o-mini").unwrap();
        let opts = build_options(&spec);
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, None);
    }

    #[test]
    fn build_options_forwards_max_output() {
        let spec = ModelSpec::named("gpt-4o-mini").unwrap().with_params(ModelParams {
            temperature: 0.2,
            max_output_tokens: Some(2048),
            context_window: None,
        });
        let opts = build_options(&spec);
        assert_eq!(opts.temperature, Some(0.2));
        assert_eq!(opts.max_tokens, Some(2048));
    }

    #[test]
    fn inline_image_keeps_mime_type() {
        let data = to_image_data(&ImageRef::Inline {
            data: "aGVsbG8=".into(),
            mime_type: "image/jpeg".into(),
        });
        assert_eq!(data.mime_type, "image/jpeg");
    }

    #[tokio::test]
    async fn unregistered_model_is_transport_error() {
        let backend = ProviderBackend::new("empty");
        let spec = ModelSpec::named("gpt-4o").unwrap();
        let err = backend
            .send(&spec, &[Message::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Transport(_)));
    }
}
