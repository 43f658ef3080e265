//! Remote adapter
//!
//! Apps with `runtime.engine = "remote"` run elsewhere. The runtime still
//! resolves credentials and mints one capability token per declared
//! permission, then forwards `{ inputs, tokens }` to `run.url` with every
//! token reduced to an opaque bearer string. The app answers
//! `{ outputs, trace? }`; its trace is accepted only in the safe wire shape.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ToolError;
use crate::manifest::RemoteTarget;
use crate::net::read_capped;
use crate::runtime::TraceWire;
use crate::token::CapabilityToken;

/// Response bodies beyond this size are refused
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BearerGrant {
    token: String,
    scope: String,
    expires_in_ms: u64,
}

#[derive(Debug, Serialize)]
struct ForwardRequest<'a> {
    inputs: &'a Map<String, Value>,
    tokens: BTreeMap<String, BearerGrant>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RemoteResponse {
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub trace: Vec<TraceWire>,
}

pub struct RemoteAdapter {
    client: reqwest::Client,
}

impl RemoteAdapter {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    pub async fn forward(
        &self,
        target: &RemoteTarget,
        inputs: &Map<String, Value>,
        tokens: &[CapabilityToken],
        timeout: Duration,
    ) -> Result<RemoteResponse, ToolError> {
        let payload = ForwardRequest {
            inputs,
            tokens: tokens
                .iter()
                .map(|t| {
                    (
                        t.permission().to_string(),
                        BearerGrant {
                            token: t.bearer(),
                            scope: t.scope().to_string(),
                            expires_in_ms: t.remaining().as_millis() as u64,
                        },
                    )
                })
                .collect(),
        };

        let builder = match target.method.to_ascii_uppercase().as_str() {
            "PUT" => self.client.put(&target.url),
            _ => self.client.post(&target.url),
        };

        tracing::debug!(url = %target.url, tokens = tokens.len(), "forwarding run to remote app");

        let timeout_ms = timeout.as_millis() as u64;
        let response = builder
            .timeout(timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ToolError::from_transport(&e, timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "remote app returned an error status");
            return Err(ToolError::from_status(status));
        }

        if response
            .content_length()
            .is_some_and(|len| len > MAX_RESPONSE_BYTES as u64)
        {
            return Err(too_large());
        }

        let body = read_capped(response, MAX_RESPONSE_BYTES)
            .await
            .map_err(|e| ToolError::from_transport(&e, timeout_ms))?;
        if body.truncated {
            return Err(too_large());
        }

        serde_json::from_slice(&body.bytes).map_err(|_| ToolError::Provider {
            reason: "remote app returned malformed JSON".to_string(),
        })
    }
}

fn too_large() -> ToolError {
    ToolError::Provider {
        reason: "remote response too large".to_string(),
    }
}

impl Default for RemoteAdapter {
    fn default() -> Self {
        Self::new()
    }
}
