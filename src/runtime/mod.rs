//! Runtime Module - manifest execution
//!
//! - `run`: run model, modes and the status state machine
//! - `trace`: redacted per-step trace
//! - `result`: terminal status policy and output projection
//! - `executor`: [`Runtime`], which drives a run step by step
//!
//! For static checks, see the `manifest` module.

mod executor;
mod result;
mod run;
mod trace;

pub use executor::Runtime;
pub use result::RunAssembler;
pub use run::{Run, RunMode, RunRecord, RunRequest, RunStatus};
pub use trace::{StepTimer, TraceEntry, TraceRecorder, TraceStatus, TraceWire};
