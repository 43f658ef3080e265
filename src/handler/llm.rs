//! Text completion handlers: `llm.complete` and `openai.chat`

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{
    optional_f64, optional_str, optional_u64, required_str, truncate, ToolHandler, ToolOutput,
    LLM_COMPLETE, OPENAI_CHAT,
};
use crate::credential::Credential;
use crate::error::ToolError;
use crate::provider::{ChatMessage, CompletionBackend, CompletionRequest};
use crate::token::CapabilityToken;

pub const MAX_COMPLETION_TOKENS: u64 = 4096;
pub const MAX_OUTPUT_CHARS: usize = 20_000;

const OUTPUT_KEYS: &[&str] = &["text"];

fn sampling(
    mut request: CompletionRequest,
    args: &Map<String, Value>,
) -> Result<CompletionRequest, ToolError> {
    if let Some(max_tokens) = optional_u64(args, "max_tokens")? {
        if max_tokens == 0 || max_tokens > MAX_COMPLETION_TOKENS {
            return Err(ToolError::invalid_input(format!(
                "max_tokens must be between 1 and {}",
                MAX_COMPLETION_TOKENS
            )));
        }
        request = request.with_max_tokens(max_tokens as u32);
    }
    if let Some(temperature) = optional_f64(args, "temperature")? {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ToolError::invalid_input("temperature must be between 0 and 2"));
        }
        request = request.with_temperature(temperature as f32);
    }
    Ok(request)
}

async fn run_completion(
    backend: &dyn CompletionBackend,
    credential: &Credential,
    request: CompletionRequest,
) -> Result<ToolOutput, ToolError> {
    let completion = backend.complete(credential.secret(), request).await?;

    Ok(ToolOutput::single("text", truncate(completion.text, MAX_OUTPUT_CHARS))
        .with_tokens(completion.usage.total_tokens as u64))
}

/// `llm.complete`: one prompt through the configured LLM provider
pub struct LlmCompleteHandler {
    backend: Arc<dyn CompletionBackend>,
}

impl LlmCompleteHandler {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl ToolHandler for LlmCompleteHandler {
    fn capability(&self) -> &str {
        LLM_COMPLETE
    }

    fn provider(&self) -> Option<&str> {
        Some(self.backend.name())
    }

    fn output_keys(&self) -> &[&'static str] {
        OUTPUT_KEYS
    }

    async fn invoke(
        &self,
        token: &CapabilityToken,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let credential = token.authorize(LLM_COMPLETE)?;

        let mut request = CompletionRequest::prompt(required_str(args, "prompt")?);
        if let Some(system) = optional_str(args, "system")? {
            request = request.with_system(system);
        }
        let request = sampling(request, args)?;

        run_completion(self.backend.as_ref(), credential, request).await
    }
}

/// `openai.chat`: Chat Completions with explicit `messages` (or a `prompt`)
pub struct OpenAiChatHandler {
    backend: Arc<dyn CompletionBackend>,
}

impl OpenAiChatHandler {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }

    fn messages(args: &Map<String, Value>) -> Result<Vec<ChatMessage>, ToolError> {
        match args.get("messages") {
            Some(Value::Array(items)) if !items.is_empty() => items
                .iter()
                .map(|item| {
                    serde_json::from_value::<ChatMessage>(item.clone()).map_err(|_| {
                        ToolError::invalid_input("each message needs string 'role' and 'content'")
                    })
                })
                .collect(),
            Some(_) => Err(ToolError::invalid_input("'messages' must be a non-empty array")),
            None => Ok(vec![ChatMessage::user(required_str(args, "prompt")?)]),
        }
    }
}

#[async_trait]
impl ToolHandler for OpenAiChatHandler {
    fn capability(&self) -> &str {
        OPENAI_CHAT
    }

    fn provider(&self) -> Option<&str> {
        Some("openai")
    }

    fn output_keys(&self) -> &[&'static str] {
        OUTPUT_KEYS
    }

    async fn invoke(
        &self,
        token: &CapabilityToken,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let credential = token.authorize(OPENAI_CHAT)?;

        let mut request = CompletionRequest::chat(Self::messages(args)?);
        if let Some(model) = optional_str(args, "model")? {
            request = request.with_model(model);
        }
        if let Some(system) = optional_str(args, "system")? {
            request = request.with_system(system);
        }
        let request = sampling(request, args)?;

        run_completion(self.backend.as_ref(), credential, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{CredentialSource, Secret};
    use crate::error::TokenError;
    use crate::provider::MockBackend;
    use crate::token::TokenMinter;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::Instant;
    use uuid::Uuid;

    fn token(scope: &str) -> CapabilityToken {
        let credential = Arc::new(Credential::new(
            None,
            "openai",
            CredentialSource::Platform,
            Secret::new("sk-test"),
        ));
        TokenMinter::new(Duration::from_secs(30)).mint(
            Uuid::new_v4(),
            scope,
            credential,
            Instant::now() + Duration::from_secs(30),
        )
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn llm_complete_returns_text_and_tokens() {
        let backend = Arc::new(MockBackend::with_responses(vec!["A draft".into()]));
        let handler = LlmCompleteHandler::new(backend.clone());

        let out = handler
            .invoke(&token(LLM_COMPLETE), &args(json!({"prompt": "Write", "max_tokens": "200"})))
            .await
            .unwrap();

        assert_eq!(out.values["text"], "A draft");
        assert!(out.tokens_used.unwrap() > 0);
        assert_eq!(backend.last_request().unwrap().max_tokens, Some(200));
    }

    #[tokio::test]
    async fn wrong_scope_is_refused_before_backend_call() {
        let backend = Arc::new(MockBackend::new());
        let handler = LlmCompleteHandler::new(backend.clone());

        let err = handler
            .invoke(&token(OPENAI_CHAT), &args(json!({"prompt": "x"})))
            .await
            .unwrap_err();

        assert!(matches!(err, ToolError::Token(TokenError::ScopeMismatch { .. })));
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn foreign_token_is_refused_before_args_are_checked() {
        let backend = Arc::new(MockBackend::new());
        let llm = LlmCompleteHandler::new(backend.clone());
        let chat = OpenAiChatHandler::new(backend.clone());
        let bad_args = args(json!({"max_tokens": 0}));

        let err = llm.invoke(&token("email.send"), &bad_args).await.unwrap_err();
        assert!(matches!(err, ToolError::Token(TokenError::ScopeMismatch { .. })));

        let err = chat
            .invoke(&token("email.send"), &args(json!({"messages": "nope"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Token(TokenError::ScopeMismatch { .. })));
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn limits_are_enforced() {
        let handler = LlmCompleteHandler::new(Arc::new(MockBackend::new()));
        let t = token(LLM_COMPLETE);

        let err = handler
            .invoke(&t, &args(json!({"prompt": "x", "max_tokens": 100000})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput { .. }));

        let err = handler.invoke(&t, &args(json!({}))).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn output_is_truncated() {
        let long = "x".repeat(MAX_OUTPUT_CHARS + 50);
        let handler = LlmCompleteHandler::new(Arc::new(MockBackend::with_responses(vec![long])));
        let out = handler
            .invoke(&token(LLM_COMPLETE), &args(json!({"prompt": "go"})))
            .await
            .unwrap();
        assert_eq!(out.values["text"].as_str().unwrap().len(), MAX_OUTPUT_CHARS);
    }

    #[tokio::test]
    async fn openai_chat_accepts_messages() {
        let backend = Arc::new(MockBackend::new().named("openai"));
        let handler = OpenAiChatHandler::new(backend.clone());

        handler
            .invoke(
                &token(OPENAI_CHAT),
                &args(json!({
                    "messages": [
                        {"role": "system", "content": "Be terse"},
                        {"role": "user", "content": "Hi"}
                    ],
                    "model": "gpt-4o"
                })),
            )
            .await
            .unwrap();

        let req = backend.last_request().unwrap();
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.model.as_deref(), Some("gpt-4o"));
    }

    #[tokio::test]
    async fn openai_chat_rejects_bad_messages() {
        let handler = OpenAiChatHandler::new(Arc::new(MockBackend::new()));
        let err = handler
            .invoke(&token(OPENAI_CHAT), &args(json!({"messages": [{"role": 1}]})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput { .. }));
    }
}
