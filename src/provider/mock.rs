//! Mock backend for testing
//!
//! Returns queued responses (or failures) without network calls and
//! records every request for assertions.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{Completion, CompletionBackend, CompletionRequest, TokenUsage};
use crate::credential::Secret;
use crate::error::ToolError;

pub struct MockBackend {
    name: String,
    /// FIFO of scripted results
    responses: Mutex<VecDeque<Result<String, ToolError>>>,
    default_response: String,
    requests: Mutex<Vec<CompletionRequest>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            responses: Mutex::new(VecDeque::new()),
            default_response: "Mock response".to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_responses(responses: Vec<String>) -> Self {
        let backend = Self::new();
        lock(&backend.responses).extend(responses.into_iter().map(Ok));
        backend
    }

    /// Report a provider name other than `mock` (credential lookups use it)
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_default(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    pub fn queue_response(&self, response: impl Into<String>) {
        lock(&self.responses).push_back(Ok(response.into()));
    }

    pub fn queue_error(&self, error: ToolError) {
        lock(&self.responses).push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        lock(&self.requests).last().cloned()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        _api_key: &Secret,
        request: CompletionRequest,
    ) -> Result<Completion, ToolError> {
        let prompt_len = request.prompt_len();
        lock(&self.requests).push(request);

        let text = lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| Ok(self.default_response.clone()))?;

        let usage = TokenUsage::estimate(prompt_len, text.len());
        Ok(Completion { text, usage })
    }
}
