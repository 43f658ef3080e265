//! `image.transform`: resize/convert an image through the image service

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{optional_str, optional_u64, required_str, ToolHandler, ToolOutput, IMAGE_TRANSFORM};
use crate::error::ToolError;
use crate::provider::{status_error, REQUEST_TIMEOUT};
use crate::token::CapabilityToken;

pub const MAX_DIMENSION: u64 = 2048;

const FORMATS: &[&str] = &["png", "jpeg", "webp"];
const OUTPUT_KEYS: &[&str] = &["image_url"];

pub struct ImageTransformHandler {
    client: reqwest::Client,
    endpoint: String,
}

impl ImageTransformHandler {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
        }
    }

    fn dimension(args: &Map<String, Value>, key: &str) -> Result<Option<u64>, ToolError> {
        match optional_u64(args, key)? {
            Some(0) => Err(ToolError::invalid_input(format!("{} must be positive", key))),
            Some(d) if d > MAX_DIMENSION => Err(ToolError::invalid_input(format!(
                "{} exceeds {}px",
                key, MAX_DIMENSION
            ))),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl ToolHandler for ImageTransformHandler {
    fn capability(&self) -> &str {
        IMAGE_TRANSFORM
    }

    fn provider(&self) -> Option<&str> {
        Some("image")
    }

    fn output_keys(&self) -> &[&'static str] {
        OUTPUT_KEYS
    }

    fn outbound_url(&self, args: &Map<String, Value>) -> Option<String> {
        args.get("source_url").and_then(Value::as_str).map(String::from)
    }

    async fn invoke(
        &self,
        token: &CapabilityToken,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let credential = token.authorize(IMAGE_TRANSFORM)?;

        let source_url = required_str(args, "source_url")?;
        let width = Self::dimension(args, "width")?;
        let height = Self::dimension(args, "height")?;
        if width.is_none() && height.is_none() {
            return Err(ToolError::invalid_input("width or height is required"));
        }
        let format = optional_str(args, "format")?.unwrap_or("png").to_ascii_lowercase();
        if !FORMATS.contains(&format.as_str()) {
            return Err(ToolError::invalid_input(format!(
                "format must be one of: {}",
                FORMATS.join(", ")
            )));
        }

        let payload = TransformRequest {
            source_url,
            width,
            height,
            format: &format,
        };

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
            return Err(status_error("image", response.status()));
        }

        let done: TransformResponse = response
            .json()
            .await
            .map_err(|e| ToolError::from_transport(&e, timeout_ms))?;

        Ok(ToolOutput::single("image_url", done.url))
    }
}

#[derive(Serialize)]
struct TransformRequest<'a> {
    source_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u64>,
    format: &'a str,
}

#[derive(Deserialize)]
struct TransformResponse {
    url: String,
}
