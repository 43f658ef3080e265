//! Caller input checks against a manifest's input schema

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use super::{InputSpec, InputType, Manifest};
use crate::error::ManifestError;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

/// Apply defaults and type-check the caller's inputs.
///
/// Unknown keys are rejected, `null` counts as not supplied, and a required
/// input with neither a value nor a default is missing. The result holds
/// exactly the declared inputs that have a value.
pub fn validate_inputs(
    manifest: &Manifest,
    supplied: &Map<String, Value>,
) -> Result<Map<String, Value>, ManifestError> {
    if let Some(unknown) = supplied
        .keys()
        .find(|k| !manifest.inputs_schema.contains_key(*k))
    {
        return Err(ManifestError::UnknownInput {
            name: unknown.clone(),
        });
    }

    let mut resolved = Map::new();
    for (name, spec) in &manifest.inputs_schema {
        let value = match supplied.get(name) {
            Some(Value::Null) | None => spec.default.clone(),
            Some(v) => Some(v.clone()),
        };

        match value {
            Some(value) => {
                check_value(name, spec, &value)?;
                resolved.insert(name.clone(), value);
            }
            None if spec.required => {
                return Err(ManifestError::MissingInput { name: name.clone() })
            }
            None => {}
        }
    }

    Ok(resolved)
}

/// Check one value against its declared input type
pub(crate) fn check_value(name: &str, spec: &InputSpec, value: &Value) -> Result<(), ManifestError> {
    let mismatch = || ManifestError::InputType {
        name: name.to_string(),
        expected: spec.input_type.to_string(),
        actual: json_type(value).to_string(),
    };

    match spec.input_type {
        InputType::String | InputType::Text => {
            value.as_str().ok_or_else(mismatch)?;
        }
        InputType::Number => {
            if !value.is_number() {
                return Err(mismatch());
            }
        }
        InputType::Integer => {
            if !(value.is_i64() || value.is_u64()) {
                return Err(mismatch());
            }
        }
        InputType::Boolean => {
            if !value.is_boolean() {
                return Err(mismatch());
            }
        }
        InputType::Url => {
            let s = value.as_str().ok_or_else(mismatch)?;
            let parsed = url::Url::parse(s).map_err(|_| mismatch())?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(mismatch());
            }
        }
        InputType::Email => {
            let s = value.as_str().ok_or_else(mismatch)?;
            if !EMAIL_RE.is_match(s) {
                return Err(mismatch());
            }
        }
        InputType::Enum => {
            let s = value.as_str().ok_or_else(mismatch)?;
            let choices = spec.choices.as_deref().unwrap_or_default();
            if !choices.iter().any(|c| c == s) {
                return Err(ManifestError::InputNotAllowed {
                    name: name.to_string(),
                    allowed: choices.join(", "),
                });
            }
        }
        InputType::Json => {}
    }

    Ok(())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
