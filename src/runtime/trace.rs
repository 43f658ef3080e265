//! Trace recording
//!
//! Entries hold metadata only: tool id, timing, token count, status and an
//! [`ErrorKind`]. There is no field that could carry a credential or a
//! provider payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Ok,
    Error,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub tool: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    pub status: TraceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl TraceEntry {
    /// Entry for a step that never started
    pub fn skipped(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            started_at: Utc::now(),
            duration_ms: 0,
            tokens_used: None,
            status: TraceStatus::Skipped,
            error_kind: None,
        }
    }
}

/// Client display shape: `{ tool, tokens?, latencyMs, status }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceWire {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default)]
    pub latency_ms: u64,
    pub status: TraceStatus,
}

impl From<&TraceEntry> for TraceWire {
    fn from(entry: &TraceEntry) -> Self {
        Self {
            tool: entry.tool.clone(),
            tokens: entry.tokens_used,
            latency_ms: entry.duration_ms,
            status: entry.status,
        }
    }
}

/// Open step: wall-clock start for the record, monotonic start for latency
#[derive(Debug)]
pub struct StepTimer {
    tool: String,
    started_at: DateTime<Utc>,
    start: Instant,
}

/// Append-only trace for one run
#[derive(Debug, Default)]
pub struct TraceRecorder {
    entries: Vec<TraceEntry>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, tool: &str) -> StepTimer {
        StepTimer {
            tool: tool.to_string(),
            started_at: Utc::now(),
            start: Instant::now(),
        }
    }

    pub fn ok(&mut self, timer: StepTimer, tokens_used: Option<u64>) {
        self.push(timer, TraceStatus::Ok, tokens_used, None);
    }

    pub fn error(&mut self, timer: StepTimer, kind: ErrorKind) {
        self.push(timer, TraceStatus::Error, None, Some(kind));
    }

    pub fn skip(&mut self, tool: &str) {
        self.entries.push(TraceEntry::skipped(tool));
    }

    /// Entry reported by a remote app, already reduced to the wire shape
    pub fn remote(&mut self, wire: TraceWire) {
        self.entries.push(TraceEntry {
            tool: wire.tool,
            started_at: Utc::now(),
            duration_ms: wire.latency_ms,
            tokens_used: wire.tokens,
            status: wire.status,
            error_kind: (wire.status == TraceStatus::Error).then_some(ErrorKind::Provider),
        });
    }

    fn push(
        &mut self,
        timer: StepTimer,
        status: TraceStatus,
        tokens_used: Option<u64>,
        error_kind: Option<ErrorKind>,
    ) {
        self.entries.push(TraceEntry {
            tool: timer.tool,
            started_at: timer.started_at,
            duration_ms: timer.start.elapsed().as_millis() as u64,
            tokens_used,
            status,
            error_kind,
        });
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<TraceEntry> {
        self.entries
    }
}
