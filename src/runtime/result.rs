//! Run result assembly: terminal status policy and output projection
//!
//! | Failure | Prior output | Status | Outputs |
//! |---------|--------------|--------|---------|
//! | none | - | `completed` | projected onto the output schema |
//! | transient (timeout, rate limit, provider, quota) | yes | `partial` | every output produced so far |
//! | transient | no | `failed` | `{}` |
//! | anything else | - | `failed` | `{}` |

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::warn;

use super::run::{Run, RunStatus};
use super::trace::TraceEntry;
use crate::error::ErrorKind;
use crate::manifest::OutputType;

pub struct RunAssembler;

impl RunAssembler {
    pub fn status_for(failure: Option<ErrorKind>, has_prior_output: bool) -> RunStatus {
        match failure {
            None => RunStatus::Completed,
            Some(kind) if kind.is_transient() && has_prior_output => RunStatus::Partial,
            Some(_) => RunStatus::Failed,
        }
    }

    /// Keep declared outputs only; an empty schema keeps everything
    pub fn project(
        schema: &BTreeMap<String, OutputType>,
        produced: &Map<String, Value>,
    ) -> Map<String, Value> {
        if schema.is_empty() {
            return produced.clone();
        }

        let mut outputs = Map::new();
        for (name, output_type) in schema {
            match produced.get(name) {
                Some(value) => {
                    if !output_type.accepts(value) {
                        warn!(output = %name, expected = ?output_type, "output does not match its declared type");
                    }
                    outputs.insert(name.clone(), value.clone());
                }
                None => warn!(output = %name, "declared output was not produced"),
            }
        }
        outputs
    }

    /// Apply the status policy and seal the run
    pub fn finish(
        run: &mut Run,
        schema: &BTreeMap<String, OutputType>,
        produced: Map<String, Value>,
        failure: Option<ErrorKind>,
        trace: Vec<TraceEntry>,
        duration_ms: u64,
    ) {
        let status = Self::status_for(failure, !produced.is_empty());
        let outputs = match status {
            RunStatus::Completed => Self::project(schema, &produced),
            RunStatus::Partial => produced,
            _ => Map::new(),
        };
        run.finish(status, outputs, trace, duration_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RunMode;
    use serde_json::json;

    fn produced() -> Map<String, Value> {
        json!({"draft": "d", "final": "f"}).as_object().cloned().unwrap()
    }

    #[test]
    fn status_policy_table() {
        use ErrorKind::*;
        assert_eq!(RunAssembler::status_for(None, false), RunStatus::Completed);
        for transient in [ToolTimeout, RateLimited, Provider, QuotaExceeded] {
            assert_eq!(RunAssembler::status_for(Some(transient), true), RunStatus::Partial);
            assert_eq!(RunAssembler::status_for(Some(transient), false), RunStatus::Failed);
        }
        for fatal in [
            CredentialMissing,
            InvalidInput,
            AuthFailed,
            ScopeMismatch,
            TokenExpired,
            Template,
        ] {
            assert_eq!(RunAssembler::status_for(Some(fatal), true), RunStatus::Failed);
        }
    }

    #[test]
    fn projection_keeps_declared_outputs() {
        let schema = BTreeMap::from([("final".to_string(), OutputType::Text)]);
        let out = RunAssembler::project(&schema, &produced());
        assert_eq!(Value::Object(out), json!({"final": "f"}));

        let all = RunAssembler::project(&BTreeMap::new(), &produced());
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn failed_run_has_empty_outputs() {
        let mut run = Run::new("app", None, RunMode::Use, Map::new());
        run.transition(RunStatus::Running);
        RunAssembler::finish(
            &mut run,
            &BTreeMap::new(),
            produced(),
            Some(ErrorKind::AuthFailed),
            Vec::new(),
            1,
        );
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.outputs().is_empty());
    }

    #[test]
    fn partial_run_keeps_prior_outputs() {
        let schema = BTreeMap::from([("final".to_string(), OutputType::Text)]);
        let mut prior = Map::new();
        prior.insert("draft".into(), json!("d"));

        let mut run = Run::new("app", None, RunMode::Try, Map::new());
        run.transition(RunStatus::Running);
        RunAssembler::finish(&mut run, &schema, prior, Some(ErrorKind::ToolTimeout), Vec::new(), 1);
        assert_eq!(run.status(), RunStatus::Partial);
        assert_eq!(run.outputs()["draft"], "d");
    }
}
