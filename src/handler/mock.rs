//! Mock handler for testing and `--mock` runs
//!
//! Behaves like a real handler at the boundary (checks its token, reports
//! token usage, honours the network allowlist through `outbound_url`) but
//! returns scripted results. Every invocation is recorded.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time::Instant;
use uuid::Uuid;

use super::{ToolHandler, ToolOutput};
use crate::error::ToolError;
use crate::provider::TokenUsage;
use crate::token::CapabilityToken;

/// What a mock handler saw on one call
#[derive(Debug, Clone)]
pub struct Invocation {
    pub token_id: Uuid,
    pub run_id: Uuid,
    pub scope: String,
    pub args: Map<String, Value>,
    pub at: Instant,
}

pub struct MockHandler {
    capability: String,
    provider: Option<String>,
    output_keys: Vec<&'static str>,
    url_arg: Option<&'static str>,
    delay: Option<Duration>,
    responses: Mutex<VecDeque<Result<ToolOutput, ToolError>>>,
    invocations: Mutex<Vec<Invocation>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockHandler {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            provider: Some("mock".to_string()),
            output_keys: vec!["text"],
            url_arg: None,
            delay: None,
            responses: Mutex::new(VecDeque::new()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn without_provider(mut self) -> Self {
        self.provider = None;
        self
    }

    pub fn with_output_keys(mut self, keys: &[&'static str]) -> Self {
        self.output_keys = keys.to_vec();
        self
    }

    /// Argument holding the outbound URL the governor must check
    pub fn with_url_arg(mut self, key: &'static str) -> Self {
        self.url_arg = Some(key);
        self
    }

    /// Sleep before answering (drives timeout scenarios)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn queue_output(&self, output: ToolOutput) {
        lock(&self.responses).push_back(Ok(output));
    }

    /// Queue a primary value (stored under the first output key)
    pub fn queue_text(&self, text: impl Into<String>) {
        let key = self.output_keys.first().copied().unwrap_or("text");
        self.queue_output(ToolOutput::single(key, text.into()));
    }

    pub fn queue_error(&self, error: ToolError) {
        lock(&self.responses).push_back(Err(error));
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.invocations).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.invocations).len()
    }

    /// Deterministic answer when nothing is queued
    fn default_output(&self, args: &Map<String, Value>) -> ToolOutput {
        let mut output = ToolOutput::new();
        for (i, key) in self.output_keys.iter().enumerate() {
            let value = match (i, args.get("prompt").and_then(Value::as_str)) {
                (0, Some(prompt)) => format!("[mock] {}", prompt),
                _ => format!("mock {}", key),
            };
            output = output.with(key, value);
        }

        let args_len = serde_json::to_string(args).map_or(0, |s| s.len());
        let out_len = serde_json::to_string(&output.values).map_or(0, |s| s.len());
        let usage = TokenUsage::estimate(args_len, out_len);
        output.with_tokens(usage.total_tokens as u64)
    }
}

#[async_trait]
impl ToolHandler for MockHandler {
    fn capability(&self) -> &str {
        &self.capability
    }

    fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    fn output_keys(&self) -> &[&'static str] {
        &self.output_keys
    }

    fn outbound_url(&self, args: &Map<String, Value>) -> Option<String> {
        let key = self.url_arg?;
        args.get(key).and_then(Value::as_str).map(String::from)
    }

    async fn invoke(
        &self,
        token: &CapabilityToken,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        token.authorize(&self.capability)?;

        lock(&self.invocations).push(Invocation {
            token_id: token.id(),
            run_id: token.run_id(),
            scope: token.scope().to_string(),
            args: args.clone(),
            at: Instant::now(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = lock(&self.responses).pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(self.default_output(args)),
        }
    }
}
