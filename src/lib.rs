//! apprun - manifest execution runtime for declarative apps
//!
//! A manifest declares inputs, outputs, permissions and an ordered list of
//! tool steps. The runtime validates it, resolves credentials per permission,
//! mints short-lived capability tokens, runs each step through a closed
//! handler registry under a quota governor, and returns a redacted run.

pub mod config;
pub mod credential;
pub mod dispatch;
pub mod error;
pub mod governor;
pub mod handler;
pub mod manifest;
pub mod net;
pub mod provider;
pub mod remote;
pub mod runtime;
pub mod store;
pub mod template;
pub mod token;

pub use config::RuntimeConfig;
pub use credential::{CredentialResolver, CredentialVault, InMemoryVault};
pub use dispatch::{BatchDispatcher, BatchJob, BatchReport, DispatchOutcome};
pub use error::{ErrorKind, FixSuggestion, ManifestError, RuntimeError};
pub use handler::{HandlerRegistry, ToolHandler};
pub use manifest::{Manifest, RawManifest, Validator};
pub use runtime::{Run, RunMode, RunRecord, RunRequest, RunStatus, Runtime, TraceEntry};
pub use store::{InMemoryRunStore, RunStore};
pub use token::{CapabilityToken, TokenMinter};
