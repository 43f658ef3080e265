//! Manifest model
//!
//! Two layers, like workflow parsing:
//! - [`RawManifest`]: the JSON/YAML wire shape as authored
//!   (`inputs`, `outputs`, `permissions`, `runtime.{engine,limits,steps}`,
//!   `demo`, optional `run` for remote apps)
//! - [`Manifest`]: the normalized, validated form the executor runs.
//!   Only [`Validator::validate`] produces one.

mod inputs;
mod validate;

pub use inputs::validate_inputs;
pub use validate::Validator;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ManifestError;

// ═══════════════════════════════════════════
// WIRE SHAPE
// ═══════════════════════════════════════════

/// Manifest as authored (JSON or YAML)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawManifest {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, RawInput>,
    #[serde(default)]
    pub outputs: BTreeMap<String, RawOutput>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub runtime: RawRuntime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demo: Option<Demo>,
    /// Remote adapter target (`runtime.engine = "remote"`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RemoteTarget>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl RawManifest {
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(json).map_err(|e| ManifestError::Parse {
            details: e.to_string(),
        })
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ManifestError> {
        serde_yaml::from_str(yaml).map_err(|e| ManifestError::Parse {
            details: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawInput {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// `"text"` or `{ "type": "text" }`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawOutput {
    Type(String),
    Spec {
        #[serde(rename = "type")]
        type_name: String,
    },
}

impl RawOutput {
    pub fn type_name(&self) -> &str {
        match self {
            RawOutput::Type(t) => t,
            RawOutput::Spec { type_name } => type_name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawRuntime {
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub limits: RawLimits,
    #[serde(default)]
    pub steps: Vec<RawStep>,
}

impl Default for RawRuntime {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            limits: RawLimits::default(),
            steps: Vec::new(),
        }
    }
}

fn default_engine() -> String {
    "steps".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    /// Outbound host allowlist (`api.example.com`, `*.example.com`, `*`)
    #[serde(default)]
    pub net: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawStep {
    pub tool: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Key the handler's primary value is stored under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Demo {
    #[serde(default)]
    pub sample_inputs: Map<String, Value>,
}

/// `run.url` + `run.method` of a remote app
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteTarget {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
}

fn default_method() -> String {
    "POST".to_string()
}

// ═══════════════════════════════════════════
// NORMALIZED MODEL
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Text,
    Number,
    Integer,
    Boolean,
    Url,
    Email,
    Enum,
    Json,
}

impl FromStr for InputType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "string" => InputType::String,
            "text" => InputType::Text,
            "number" => InputType::Number,
            "integer" => InputType::Integer,
            "boolean" => InputType::Boolean,
            "url" => InputType::Url,
            "email" => InputType::Email,
            "enum" => InputType::Enum,
            "json" => InputType::Json,
            _ => return Err(()),
        })
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InputType::String => "string",
            InputType::Text => "text",
            InputType::Number => "number",
            InputType::Integer => "integer",
            InputType::Boolean => "boolean",
            InputType::Url => "url",
            InputType::Email => "email",
            InputType::Enum => "enum",
            InputType::Json => "json",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    String,
    Text,
    Number,
    Integer,
    Boolean,
    Json,
    Url,
    Image,
}

impl FromStr for OutputType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "string" => OutputType::String,
            "text" | "markdown" => OutputType::Text,
            "number" => OutputType::Number,
            "integer" => OutputType::Integer,
            "boolean" => OutputType::Boolean,
            "json" => OutputType::Json,
            "url" => OutputType::Url,
            "image" => OutputType::Image,
            _ => return Err(()),
        })
    }
}

impl OutputType {
    /// Whether a produced value fits the declared type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            OutputType::String | OutputType::Text | OutputType::Url | OutputType::Image => {
                value.is_string()
            }
            OutputType::Number => value.is_number(),
            OutputType::Integer => value.is_i64() || value.is_u64(),
            OutputType::Boolean => value.is_boolean(),
            OutputType::Json => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputSpec {
    pub input_type: InputType,
    pub required: bool,
    pub choices: Option<Vec<String>>,
    pub default: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub tool: String,
    pub args: Map<String, Value>,
    pub output: Option<String>,
}

/// Outbound host allowlist for user-controlled URLs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkPolicy {
    allow: Vec<String>,
}

impl NetworkPolicy {
    pub fn new(allow: Vec<String>) -> Self {
        Self {
            allow: allow.into_iter().map(|h| h.to_ascii_lowercase()).collect(),
        }
    }

    pub fn deny_all() -> Self {
        Self::default()
    }

    pub fn allowed_hosts(&self) -> &[String] {
        &self.allow
    }

    /// `*` allows any public host, `*.example.com` allows subdomains
    pub fn permits_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.allow.iter().any(|pattern| {
            if pattern == "*" {
                true
            } else if let Some(suffix) = pattern.strip_prefix("*.") {
                host.ends_with(&format!(".{}", suffix))
            } else {
                *pattern == host
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    pub timeout_ms: Option<u64>,
    pub token_budget: Option<u64>,
    pub network: NetworkPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Engine {
    Steps,
    Remote(RemoteTarget),
}

/// Validated manifest. `steps` is shared and immutable once a run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub inputs_schema: BTreeMap<String, InputSpec>,
    pub outputs_schema: BTreeMap<String, OutputType>,
    pub permissions: BTreeSet<String>,
    pub steps: Arc<[Step]>,
    pub limits: Limits,
    pub engine: Engine,
    pub demo: Option<Demo>,
}

impl Manifest {
    pub fn sample_inputs(&self) -> Option<&Map<String, Value>> {
        self.demo.as_ref().map(|d| &d.sample_inputs)
    }
}
