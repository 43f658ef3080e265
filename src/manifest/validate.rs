//! Manifest Validator
//!
//! Pure and deterministic: a [`RawManifest`] either normalizes into a
//! [`Manifest`] or fails with the first [`ManifestError`] found. Runs at
//! publish/preview time and again before every run.
//!
//! Checks, in order:
//! 1. identity (id, name, version)
//! 2. input and output schemas (recognized types, enum/default sanity)
//! 3. permissions are registered capabilities
//! 4. engine and limits
//! 5. steps: tool registered, tool declared in permissions, every template
//!    reference names a declared input or an earlier step's output key

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;

use super::inputs::check_value;
use super::{
    Engine, InputSpec, InputType, Limits, Manifest, NetworkPolicy, OutputType, RawManifest, Step,
};
use crate::error::ManifestError;
use crate::handler::HandlerRegistry;
use crate::template::{NAME_RE, TEMPLATE_RESOLVER};

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+([-+][0-9A-Za-z.-]+)?$").expect("valid version regex"));

static APP_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_./-]*$").expect("valid app id regex"));

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ManifestError {
    ManifestError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

/// Static manifest checks against a handler registry
pub struct Validator<'a> {
    registry: &'a HandlerRegistry,
}

impl<'a> Validator<'a> {
    pub fn new(registry: &'a HandlerRegistry) -> Self {
        Self { registry }
    }

    pub fn validate(&self, raw: &RawManifest) -> Result<Manifest, ManifestError> {
        self.check_identity(raw)?;
        let inputs_schema = self.check_inputs(raw)?;
        let outputs_schema = self.check_outputs(raw)?;
        let permissions = self.check_permissions(raw)?;
        let engine = self.check_engine(raw)?;
        let limits = self.check_limits(raw)?;
        let steps = self.check_steps(raw, &inputs_schema, &permissions)?;

        Ok(Manifest {
            id: raw.id.clone(),
            name: raw.name.clone(),
            version: raw.version.clone(),
            inputs_schema,
            outputs_schema,
            permissions,
            steps: steps.into(),
            limits,
            engine,
            demo: raw.demo.clone(),
        })
    }

    fn check_identity(&self, raw: &RawManifest) -> Result<(), ManifestError> {
        if !APP_ID_RE.is_match(&raw.id) {
            return Err(invalid("id", format!("'{}' is not a valid app id", raw.id)));
        }
        if raw.name.trim().is_empty() {
            return Err(invalid("name", "must not be empty"));
        }
        if !VERSION_RE.is_match(&raw.version) {
            return Err(invalid(
                "version",
                format!("'{}' is not a semantic version", raw.version),
            ));
        }
        Ok(())
    }

    fn check_inputs(&self, raw: &RawManifest) -> Result<BTreeMap<String, InputSpec>, ManifestError> {
        let mut schema = BTreeMap::new();

        for (name, input) in &raw.inputs {
            if !NAME_RE.is_match(name) {
                return Err(invalid(
                    format!("inputs.{}", name),
                    "input names must be identifiers",
                ));
            }

            let input_type: InputType =
                input
                    .type_name
                    .parse()
                    .map_err(|_| ManifestError::UnknownInputType {
                        input: name.clone(),
                        type_name: input.type_name.clone(),
                    })?;

            let choices = match (input_type, &input.choices) {
                (InputType::Enum, Some(c)) if !c.is_empty() => Some(c.clone()),
                (InputType::Enum, _) => {
                    return Err(invalid(
                        format!("inputs.{}.enum", name),
                        "enum inputs need a non-empty list of values",
                    ))
                }
                (_, Some(_)) => {
                    return Err(invalid(
                        format!("inputs.{}.enum", name),
                        "only enum inputs may list values",
                    ))
                }
                (_, None) => None,
            };

            let spec = InputSpec {
                input_type,
                required: input.required,
                choices,
                default: input.default.clone(),
            };

            if let Some(default) = &spec.default {
                check_value(name, &spec, default)?;
            }

            schema.insert(name.clone(), spec);
        }

        Ok(schema)
    }

    fn check_outputs(
        &self,
        raw: &RawManifest,
    ) -> Result<BTreeMap<String, OutputType>, ManifestError> {
        raw.outputs
            .iter()
            .map(|(name, output)| {
                if !NAME_RE.is_match(name) {
                    return Err(invalid(
                        format!("outputs.{}", name),
                        "output names must be identifiers",
                    ));
                }
                let output_type = output.type_name().parse().map_err(|_| {
                    ManifestError::UnknownOutputType {
                        output: name.clone(),
                        type_name: output.type_name().to_string(),
                    }
                })?;
                Ok((name.clone(), output_type))
            })
            .collect()
    }

    fn check_permissions(&self, raw: &RawManifest) -> Result<BTreeSet<String>, ManifestError> {
        let mut permissions = BTreeSet::new();
        for permission in &raw.permissions {
            if !self.registry.contains(permission) {
                return Err(invalid(
                    "permissions",
                    format!("'{}' is not a known capability", permission),
                ));
            }
            permissions.insert(permission.clone());
        }
        Ok(permissions)
    }

    fn check_engine(&self, raw: &RawManifest) -> Result<Engine, ManifestError> {
        match raw.runtime.engine.as_str() {
            "steps" => {
                if raw.runtime.steps.is_empty() {
                    return Err(invalid("runtime.steps", "at least one step is required"));
                }
                Ok(Engine::Steps)
            }
            "remote" => {
                let target = raw
                    .run
                    .clone()
                    .ok_or_else(|| invalid("run", "remote apps must declare run.url"))?;
                if !raw.runtime.steps.is_empty() {
                    return Err(invalid("runtime.steps", "remote apps cannot declare steps"));
                }
                let parsed = url::Url::parse(&target.url)
                    .map_err(|e| invalid("run.url", format!("invalid URL: {}", e)))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(invalid("run.url", "only http/https URLs are allowed"));
                }
                if !matches!(target.method.to_ascii_uppercase().as_str(), "POST" | "PUT") {
                    return Err(invalid("run.method", "must be POST or PUT"));
                }
                Ok(Engine::Remote(target))
            }
            other => Err(invalid(
                "runtime.engine",
                format!("unknown engine '{}' (expected steps or remote)", other),
            )),
        }
    }

    fn check_limits(&self, raw: &RawManifest) -> Result<Limits, ManifestError> {
        let limits = &raw.runtime.limits;
        if limits.timeout_ms == Some(0) {
            return Err(invalid("runtime.limits.timeoutMs", "must be greater than zero"));
        }
        if limits.tokens == Some(0) {
            return Err(invalid("runtime.limits.tokens", "must be greater than zero"));
        }
        if limits.net.iter().any(|h| h.trim().is_empty()) {
            return Err(invalid("runtime.limits.net", "hosts must not be empty"));
        }

        Ok(Limits {
            timeout_ms: limits.timeout_ms,
            token_budget: limits.tokens,
            network: NetworkPolicy::new(limits.net.clone()),
        })
    }

    fn check_steps(
        &self,
        raw: &RawManifest,
        inputs: &BTreeMap<String, InputSpec>,
        permissions: &BTreeSet<String>,
    ) -> Result<Vec<Step>, ManifestError> {
        // Names visible to the next step: inputs, then outputs in order
        let mut available: BTreeSet<String> = inputs.keys().cloned().collect();
        let mut steps = Vec::with_capacity(raw.runtime.steps.len());

        for (idx, raw_step) in raw.runtime.steps.iter().enumerate() {
            let step_no = idx + 1;

            let handler =
                self.registry
                    .get(&raw_step.tool)
                    .ok_or_else(|| ManifestError::UnknownTool {
                        step: step_no,
                        tool: raw_step.tool.clone(),
                    })?;

            if !permissions.contains(&raw_step.tool) {
                return Err(ManifestError::UndeclaredPermission {
                    step: step_no,
                    tool: raw_step.tool.clone(),
                });
            }

            let args = serde_json::Value::Object(raw_step.args.clone());
            let refs = TEMPLATE_RESOLVER
                .extract_refs(&args)
                .map_err(|e| ManifestError::Template {
                    step: step_no,
                    details: e.to_string(),
                })?;

            // A reference with a default is total; only bare ones must resolve
            if let Some(unknown) = refs
                .iter()
                .find(|r| r.default.is_none() && !available.contains(&r.name))
            {
                return Err(ManifestError::UnknownReference {
                    step: step_no,
                    name: unknown.name.clone(),
                });
            }

            let keys: Vec<String> = match &raw_step.output {
                Some(key) => {
                    if !NAME_RE.is_match(key) {
                        return Err(invalid(
                            format!("runtime.steps[{}].output", idx),
                            "output keys must be identifiers",
                        ));
                    }
                    vec![key.clone()]
                }
                None => handler.output_keys().iter().map(|k| k.to_string()).collect(),
            };

            for key in keys {
                if !available.insert(key.clone()) {
                    return Err(ManifestError::DuplicateOutput { step: step_no, key });
                }
            }

            steps.push(Step {
                tool: raw_step.tool.clone(),
                args: raw_step.args.clone(),
                output: raw_step.output.clone(),
            });
        }

        Ok(steps)
    }
}
