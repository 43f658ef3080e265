//! `http.fetch`: outbound request to a URL on the app's network allowlist

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{optional_str, required_str, truncate, ToolHandler, ToolOutput, HTTP_FETCH};
use crate::error::ToolError;
use crate::net::read_capped;
use crate::provider::REQUEST_TIMEOUT;
use crate::token::CapabilityToken;

/// Response bodies are cut to this many characters
pub const MAX_BODY_CHARS: usize = 100_000;

/// Bytes read off the wire at most (4 bytes per char, UTF-8 worst case)
const MAX_BODY_BYTES: usize = MAX_BODY_CHARS * 4;

const OUTPUT_KEYS: &[&str] = &["body", "status"];

pub struct HttpFetchHandler {
    client: reqwest::Client,
}

impl HttpFetchHandler {
    pub fn new() -> Self {
        // Redirects could leave the allowlisted host
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for HttpFetchHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolHandler for HttpFetchHandler {
    fn capability(&self) -> &str {
        HTTP_FETCH
    }

    fn provider(&self) -> Option<&str> {
        None
    }

    fn output_keys(&self) -> &[&'static str] {
        OUTPUT_KEYS
    }

    fn outbound_url(&self, args: &Map<String, Value>) -> Option<String> {
        args.get("url").and_then(Value::as_str).map(String::from)
    }

    async fn invoke(
        &self,
        token: &CapabilityToken,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        token.authorize(HTTP_FETCH)?;

        let url = required_str(args, "url")?;
        let method = optional_str(args, "method")?.unwrap_or("GET").to_ascii_uppercase();

        let request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => {
                let builder = self.client.post(url);
                match args.get("body") {
                    Some(Value::String(s)) => builder.body(s.clone()),
                    Some(Value::Null) | None => builder,
                    Some(other) => builder.json(other),
                }
            }
            other => {
                return Err(ToolError::invalid_input(format!(
                    "method '{}' is not supported (GET or POST)",
                    other
                )))
            }
        };

        let timeout_ms = REQUEST_TIMEOUT.as_millis() as u64;
        let response = request
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ToolError::from_transport(&e, timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), "http.fetch target returned an error status");
            return Err(ToolError::from_status(status));
        }

        let body = read_capped(response, MAX_BODY_BYTES)
            .await
            .map_err(|e| ToolError::from_transport(&e, timeout_ms))?;
        if body.truncated {
            tracing::debug!(limit = MAX_BODY_BYTES, "http.fetch body cut at the byte limit");
        }

        Ok(ToolOutput::new()
            .with("body", truncate(body.into_text(), MAX_BODY_CHARS))
            .with("status", status.as_u16()))
    }
}
