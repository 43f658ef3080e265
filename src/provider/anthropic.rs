//! Anthropic backend (Messages API)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    status_error, ChatMessage, Completion, CompletionBackend, CompletionRequest, TokenUsage,
    REQUEST_TIMEOUT,
};
use crate::credential::Secret;
use crate::error::ToolError;

const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const API_VERSION: &str = "2023-06-01";

/// `max_tokens` is mandatory on this API
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl AnthropicBackend {
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
}

#[async_trait]
impl CompletionBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(
        &self,
        api_key: &Secret,
        request: CompletionRequest,
    ) -> Result<Completion, ToolError> {
        // System messages travel in the top-level field
        let mut system = request.system.clone();
        let mut messages = Vec::with_capacity(request.messages.len());
        for message in &request.messages {
            if message.role == "system" {
                system = Some(match system {
                    Some(s) => format!("{}\n\n{}", s, message.content),
                    None => message.content.clone(),
                });
            } else {
                messages.push(message.clone());
            }
        }

        let payload = MessagesRequest {
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages,
            temperature: request.temperature,
        };

        tracing::debug!(provider = "anthropic", model = %payload.model, "sending messages request");

        let timeout_ms = REQUEST_TIMEOUT.as_millis() as u64;
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", api_key.expose())
            .header("anthropic-version", API_VERSION)
            .timeout(REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ToolError::from_transport(&e, timeout_ms))?;

        if !response.status().is_success() {
            return Err(status_error("anthropic", response.status()));
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ToolError::from_transport(&e, timeout_ms))?;

        let text: String = body
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        if text.is_empty() {
            return Err(ToolError::Provider {
                reason: "empty completion".to_string(),
            });
        }

        let usage = match body.usage {
            Some(u) => TokenUsage::new(u.input_tokens, u.output_tokens),
            None => TokenUsage::estimate(request.prompt_len(), text.len()),
        };

        Ok(Completion { text, usage })
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn completes_against_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "sk-ant"))
            .and(header("anthropic-version", API_VERSION))
            .and(body_partial_json(json!({ "system": "Be brief", "max_tokens": 1024 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{ "type": "text", "text": "Short answer" }],
                "usage": { "input_tokens": 8, "output_tokens": 3 }
            })))
            .mount(&server)
            .await;

        let backend = AnthropicBackend::new(&server.uri());
        let completion = backend
            .complete(
                &Secret::new("sk-ant"),
                CompletionRequest::prompt("Question?").with_system("Be brief"),
            )
            .await
            .unwrap();

        assert_eq!(completion.text, "Short answer");
        assert_eq!(completion.usage, TokenUsage::new(8, 3));
    }

    #[tokio::test]
    async fn server_error_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529))
            .mount(&server)
            .await;

        let backend = AnthropicBackend::new(&server.uri());
        let err = backend
            .complete(&Secret::new("sk-ant"), CompletionRequest::prompt("Hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Provider { .. }));
    }
}
