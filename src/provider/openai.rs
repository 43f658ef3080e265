//! OpenAI backend (Chat Completions API)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    status_error, ChatMessage, Completion, CompletionBackend, CompletionRequest, TokenUsage,
    REQUEST_TIMEOUT,
};
use crate::credential::Secret;
use crate::error::ToolError;

const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAIBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OpenAIBackend {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn build_messages(&self, request: &CompletionRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(ref system) = request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().cloned());
        messages
    }
}

#[async_trait]
impl CompletionBackend for OpenAIBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        api_key: &Secret,
        request: CompletionRequest,
    ) -> Result<Completion, ToolError> {
        let payload = ChatCompletionRequest {
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            messages: self.build_messages(&request),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        tracing::debug!(
            provider = "openai",
            model = %payload.model,
            messages_count = payload.messages.len(),
            "sending chat completion"
        );

        let timeout_ms = REQUEST_TIMEOUT.as_millis() as u64;
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key.expose())
            .timeout(REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ToolError::from_transport(&e, timeout_ms))?;

        if !response.status().is_success() {
            return Err(status_error("openai", response.status()));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ToolError::from_transport(&e, timeout_ms))?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ToolError::Provider {
                reason: "empty completion".to_string(),
            })?;

        let usage = match body.usage {
            Some(u) => TokenUsage::new(u.prompt_tokens, u.completion_tokens),
            None => TokenUsage::estimate(request.prompt_len(), text.len()),
        };

        Ok(Completion { text, usage })
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    prompt_tokens: u32,
    completion_tokens: u32,
}
