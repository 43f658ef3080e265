//! `email.send`: outbound email through an HTTP email API

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{optional_str, required_str, ToolHandler, ToolOutput, EMAIL_SEND};
use crate::error::ToolError;
use crate::provider::{status_error, REQUEST_TIMEOUT};
use crate::token::CapabilityToken;

pub const MAX_RECIPIENTS: usize = 10;
pub const MAX_SUBJECT_CHARS: usize = 200;

const DEFAULT_SENDER: &str = "apprun <noreply@apprun.dev>";
const OUTPUT_KEYS: &[&str] = &["message_id"];

static ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid address regex"));

pub struct EmailSendHandler {
    client: reqwest::Client,
    endpoint: String,
}

impl EmailSendHandler {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
        }
    }

    /// `to` may be one address or a list
    fn recipients(args: &Map<String, Value>) -> Result<Vec<String>, ToolError> {
        let to: Vec<String> = match args.get("to") {
            Some(Value::String(s)) => s.split(',').map(|a| a.trim().to_string()).collect(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(|s| s.trim().to_string())
                        .ok_or_else(|| ToolError::invalid_input("recipients must be strings"))
                })
                .collect::<Result<_, _>>()?,
            _ => return Err(ToolError::invalid_input("'to' is required")),
        };

        if to.is_empty() || to.len() > MAX_RECIPIENTS {
            return Err(ToolError::invalid_input(format!(
                "between 1 and {} recipients are allowed",
                MAX_RECIPIENTS
            )));
        }
        if let Some(bad) = to.iter().find(|a| !ADDRESS_RE.is_match(a)) {
            return Err(ToolError::invalid_input(format!("'{}' is not an email address", bad)));
        }
        Ok(to)
    }
}

#[async_trait]
impl ToolHandler for EmailSendHandler {
    fn capability(&self) -> &str {
        EMAIL_SEND
    }

    fn provider(&self) -> Option<&str> {
        Some("email")
    }

    fn output_keys(&self) -> &[&'static str] {
        OUTPUT_KEYS
    }

    async fn invoke(
        &self,
        token: &CapabilityToken,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let credential = token.authorize(EMAIL_SEND)?;

        let to = Self::recipients(args)?;
        let subject = required_str(args, "subject")?;
        if subject.chars().count() > MAX_SUBJECT_CHARS {
            return Err(ToolError::invalid_input(format!(
                "subject is longer than {} characters",
                MAX_SUBJECT_CHARS
            )));
        }

        let payload = SendRequest {
            from: optional_str(args, "from")?.unwrap_or(DEFAULT_SENDER),
            to: &to,
            subject,
            text: required_str(args, "body")?,
        };

        tracing::debug!(recipients = to.len(), "sending email");

        let timeout_ms = REQUEST_TIMEOUT.as_millis() as u64;
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(credential.secret().expose())
            .timeout(REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ToolError::from_transport(&e, timeout_ms))?;

        if !response.status().is_success() {
            return Err(status_error("email", response.status()));
        }

        let sent: SendResponse = response
            .json()
            .await
            .map_err(|e| ToolError::from_transport(&e, timeout_ms))?;

        Ok(ToolOutput::single("message_id", sent.id))
    }
}

#[derive(Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct SendResponse {
    id: String,
}
