//! # Completion Backends
//!
//! Downstream LLM APIs behind one trait, used by the `llm.complete` and
//! `openai.chat` handlers.
//!
//! - [`CompletionBackend`] - core trait; the API key comes from the
//!   capability token on every call, backends never own one
//! - [`OpenAIBackend`] - OpenAI Chat Completions
//! - [`AnthropicBackend`] - Anthropic Messages API
//! - [`MockBackend`] - queued responses, records requests
//!
//! Every failure is normalized into [`ToolError`]; provider response bodies
//! are dropped, only the HTTP status class survives.
//!
//! ## Token Estimation
//!
//! ```rust
//! use apprun::provider::TokenUsage;
//!
//! let usage = TokenUsage::estimate(300, 150);
//! assert_eq!(usage.total_tokens, 150);
//! ```

mod anthropic;
mod mock;
mod openai;

pub use anthropic::AnthropicBackend;
pub use mock::MockBackend;
pub use openai::OpenAIBackend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::credential::Secret;
use crate::error::{RuntimeError, ToolError};

/// Average characters per token for mixed content
const CHARS_PER_TOKEN_MIXED: f32 = 3.0;

/// Per-request ceiling; the run governor usually cuts in first
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Provider name, also the key the credential resolver looks up
    fn name(&self) -> &str;

    async fn complete(
        &self,
        api_key: &Secret,
        request: CompletionRequest,
    ) -> Result<Completion, ToolError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub system: Option<String>,
    /// Backend default when `None`
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    /// Single user prompt
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self::chat(vec![ChatMessage::user(prompt)])
    }

    pub fn chat(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Characters sent, for usage estimation
    pub fn prompt_len(&self) -> usize {
        self.system.as_ref().map_or(0, |s| s.len())
            + self.messages.iter().map(|m| m.content.len()).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    /// Estimate when the provider reports no usage
    pub fn estimate(prompt_len: usize, response_len: usize) -> Self {
        let tokens = |len: usize| (len as f32 / CHARS_PER_TOKEN_MIXED).ceil() as u32;
        Self::new(tokens(prompt_len), tokens(response_len))
    }
}

/// Create a backend by provider name
///
/// | Name | Endpoint |
/// |------|----------|
/// | `openai` | `providers.openai_base_url` |
/// | `anthropic` | `providers.anthropic_base_url` |
/// | `mock` | none |
pub fn create_backend(
    name: &str,
    config: &RuntimeConfig,
) -> Result<Arc<dyn CompletionBackend>, RuntimeError> {
    match name.to_lowercase().as_str() {
        "openai" => Ok(Arc::new(OpenAIBackend::new(&config.providers.openai_base_url))),
        "anthropic" => Ok(Arc::new(AnthropicBackend::new(
            &config.providers.anthropic_base_url,
        ))),
        "mock" => Ok(Arc::new(MockBackend::new())),
        other => Err(RuntimeError::Config {
            reason: format!(
                "unknown LLM provider '{}'. Available: openai, anthropic, mock",
                other
            ),
        }),
    }
}

/// Map a non-success response onto the taxonomy, dropping the body
pub(crate) fn status_error(provider: &str, status: reqwest::StatusCode) -> ToolError {
    tracing::warn!(provider, status = status.as_u16(), "provider returned an error status");
    ToolError::from_status(status)
}
