//! Run model
//!
//! A [`Run`] is created fresh per invocation, appended to while running and
//! frozen once its status is terminal. Only the executor mutates it; callers
//! get read-only accessors and the persisted [`RunRecord`] shape.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::trace::{TraceEntry, TraceWire};
use crate::manifest::RawManifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Low-trust trial: constrained platform keys, short ceiling
    Try,
    /// Authenticated: caller's own keys first
    Use,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "try" => Ok(RunMode::Try),
            "use" => Ok(RunMode::Use),
            other => Err(format!("unknown mode '{}' (expected try or use)", other)),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunMode::Try => "try",
            RunMode::Use => "use",
        })
    }
}

/// `pending → running → {completed | partial | failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Partial | RunStatus::Failed)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (
                    RunStatus::Running,
                    RunStatus::Completed | RunStatus::Partial | RunStatus::Failed
                )
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Run {
    id: Uuid,
    app_id: String,
    user_id: Option<String>,
    mode: RunMode,
    inputs: Map<String, Value>,
    status: RunStatus,
    outputs: Map<String, Value>,
    trace: Vec<TraceEntry>,
    duration_ms: u64,
    created_at: DateTime<Utc>,
}

impl Run {
    pub(crate) fn new(
        app_id: impl Into<String>,
        user_id: Option<String>,
        mode: RunMode,
        inputs: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            app_id: app_id.into(),
            user_id,
            mode,
            inputs,
            status: RunStatus::Pending,
            outputs: Map::new(),
            trace: Vec::new(),
            duration_ms: 0,
            created_at: Utc::now(),
        }
    }

    /// Illegal transitions are refused; returns whether the status changed
    pub(crate) fn transition(&mut self, next: RunStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(run_id = %self.id, from = %self.status, to = %next, "illegal run transition refused");
            return false;
        }
        self.status = next;
        true
    }

    /// Seal the run: outputs, trace and duration are written once, with the terminal status
    pub(crate) fn finish(
        &mut self,
        status: RunStatus,
        outputs: Map<String, Value>,
        trace: Vec<TraceEntry>,
        duration_ms: u64,
    ) {
        if !status.is_terminal() || !self.transition(status) {
            return;
        }
        self.outputs = outputs;
        self.trace = trace;
        self.duration_ms = duration_ms;
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn outputs(&self) -> &Map<String, Value> {
        &self.outputs
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    /// Client-safe trace shape
    pub fn trace_wire(&self) -> Vec<TraceWire> {
        self.trace.iter().map(TraceWire::from).collect()
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn to_record(&self) -> RunRecord {
        RunRecord {
            id: self.id,
            app_id: self.app_id.clone(),
            user_id: self.user_id.clone(),
            mode: self.mode,
            status: self.status,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            trace: self.trace.clone(),
            duration_ms: self.duration_ms,
            created_at: self.created_at,
        }
    }
}

/// Persisted run shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub app_id: String,
    pub user_id: Option<String>,
    pub mode: RunMode,
    pub status: RunStatus,
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
    pub trace: Vec<TraceEntry>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// `runApp` invocation
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub manifest: RawManifest,
    pub inputs: Map<String, Value>,
    pub user_id: Option<String>,
    pub mode: RunMode,
    pub fallback_allowed: bool,
}

impl RunRequest {
    pub fn new(manifest: RawManifest, mode: RunMode) -> Self {
        Self {
            manifest,
            inputs: Map::new(),
            user_id: None,
            mode,
            fallback_allowed: false,
        }
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_fallback(mut self, allowed: bool) -> Self {
        self.fallback_allowed = allowed;
        self
    }
}
