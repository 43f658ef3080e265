//! # Tool Handlers
//!
//! A closed registry of capability implementations, built once at startup
//! and immutable afterwards. Lookup is by capability id; there is no dynamic
//! loading, so adding a capability means adding a type here.
//!
//! | Capability | Handler | Provider key | Output keys |
//! |------------|---------|--------------|-------------|
//! | `llm.complete` | [`LlmCompleteHandler`] | configured LLM provider | `text` |
//! | `openai.chat` | [`OpenAiChatHandler`] | `openai` | `text` |
//! | `http.fetch` | [`HttpFetchHandler`] | none | `body`, `status` |
//! | `email.send` | [`EmailSendHandler`] | `email` | `message_id` |
//! | `image.transform` | [`ImageTransformHandler`] | `image` | `image_url` |
//!
//! Every handler checks its token with
//! [`CapabilityToken::authorize`](crate::token::CapabilityToken::authorize)
//! before building a request, and reports failures only through
//! [`ToolError`].

mod email;
mod http_fetch;
mod image;
mod llm;
mod mock;

pub use email::EmailSendHandler;
pub use http_fetch::HttpFetchHandler;
pub use image::ImageTransformHandler;
pub use llm::{LlmCompleteHandler, OpenAiChatHandler};
pub use mock::{Invocation, MockHandler};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, ToolError};
use crate::provider::{create_backend, OpenAIBackend};
use crate::token::CapabilityToken;

pub const LLM_COMPLETE: &str = "llm.complete";
pub const OPENAI_CHAT: &str = "openai.chat";
pub const HTTP_FETCH: &str = "http.fetch";
pub const EMAIL_SEND: &str = "email.send";
pub const IMAGE_TRANSFORM: &str = "image.transform";

/// Successful handler result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub values: Map<String, Value>,
    pub tokens_used: Option<u64>,
}

impl ToolOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(key: &str, value: impl Into<Value>) -> Self {
        Self::new().with(key, value)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Capability id this handler implements (and the only token scope it accepts)
    fn capability(&self) -> &str;

    /// Provider whose key the token must carry (`None`: no key needed)
    fn provider(&self) -> Option<&str>;

    /// Keys of [`ToolOutput::values`]; the first one is the primary value
    fn output_keys(&self) -> &[&'static str];

    /// User-controlled URL this call would reach, for the network allowlist
    fn outbound_url(&self, _args: &Map<String, Value>) -> Option<String> {
        None
    }

    async fn invoke(
        &self,
        token: &CapabilityToken,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError>;
}

/// Immutable capability → handler map
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Production handlers wired to the configured endpoints
    pub fn standard(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let llm = create_backend(&config.providers.llm_default, config)?;
        let openai = Arc::new(OpenAIBackend::new(&config.providers.openai_base_url));

        Ok(Self::builder()
            .register(LlmCompleteHandler::new(llm))
            .register(OpenAiChatHandler::new(openai))
            .register(HttpFetchHandler::new())
            .register(EmailSendHandler::new(&config.providers.email_endpoint))
            .register(ImageTransformHandler::new(&config.providers.image_endpoint))
            .build())
    }

    /// Every standard capability backed by a [`MockHandler`]
    pub fn mock() -> Self {
        Self::builder()
            .register(MockHandler::new(LLM_COMPLETE).with_provider("openai"))
            .register(MockHandler::new(OPENAI_CHAT).with_provider("openai"))
            .register(
                MockHandler::new(HTTP_FETCH)
                    .without_provider()
                    .with_output_keys(&["body", "status"])
                    .with_url_arg("url"),
            )
            .register(
                MockHandler::new(EMAIL_SEND)
                    .with_provider("email")
                    .with_output_keys(&["message_id"]),
            )
            .register(
                MockHandler::new(IMAGE_TRANSFORM)
                    .with_provider("image")
                    .with_output_keys(&["image_url"])
                    .with_url_arg("source_url"),
            )
            .build()
    }

    pub fn get(&self, capability: &str) -> Option<&Arc<dyn ToolHandler>> {
        self.handlers.get(capability)
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.handlers.contains_key(capability)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// capability → provider key, for the credential resolver
    pub fn provider_map(&self) -> BTreeMap<String, Option<String>> {
        self.handlers
            .iter()
            .map(|(cap, h)| (cap.clone(), h.provider().map(String::from)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl RegistryBuilder {
    /// Register a handler under its capability id (replaces an earlier one)
    pub fn register(self, handler: impl ToolHandler + 'static) -> Self {
        self.register_arc(Arc::new(handler))
    }

    pub fn register_arc(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.handlers
            .insert(handler.capability().to_string(), handler);
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

// ═══════════════════════════════════════════
// ARGUMENT HELPERS
// ═══════════════════════════════════════════

pub(crate) fn required_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, ToolError> {
    match args.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) => Err(ToolError::invalid_input(format!("'{}' is empty", key))),
        Some(_) => Err(ToolError::invalid_input(format!("'{}' must be a string", key))),
        None => Err(ToolError::invalid_input(format!("'{}' is required", key))),
    }
}

pub(crate) fn optional_str<'a>(
    args: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a str>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ToolError::invalid_input(format!("'{}' must be a string", key))),
    }
}

/// Accepts numbers and numeric strings (interpolated values arrive as text)
pub(crate) fn optional_u64(args: &Map<String, Value>, key: &str) -> Result<Option<u64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| ToolError::invalid_input(format!("'{}' must be a positive integer", key))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ToolError::invalid_input(format!("'{}' must be a positive integer", key))),
        Some(_) => Err(ToolError::invalid_input(format!("'{}' must be a positive integer", key))),
    }
}

pub(crate) fn optional_f64(args: &Map<String, Value>, key: &str) -> Result<Option<f64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ToolError::invalid_input(format!("'{}' must be a number", key))),
        Some(_) => Err(ToolError::invalid_input(format!("'{}' must be a number", key))),
    }
}

/// Truncate on a char boundary
pub(crate) fn truncate(mut text: String, max_chars: usize) -> String {
    if let Some((idx, _)) = text.char_indices().nth(max_chars) {
        text.truncate(idx);
    }
    text
}
