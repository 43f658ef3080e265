//! Error types with error codes and fix suggestions
//!
//! Error code ranges:
//! - APP-000-009: Manifest parse/validation errors
//! - APP-010-019: Input errors
//! - APP-020-029: Credential errors
//! - APP-030-039: Capability token errors
//! - APP-040-049: Template errors
//! - APP-050-059: Tool errors
//! - APP-060-069: Quota errors
//! - APP-070-079: Config/IO/store errors
//!
//! Display text never carries secret material or raw provider bodies.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

// ═══════════════════════════════════════════
// MANIFEST / INPUT REJECTIONS (000-019)
// ═══════════════════════════════════════════

/// Rejection of a manifest or of the caller's inputs. No run is created.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ManifestError {
    #[error("[APP-001] Failed to parse manifest: {details}")]
    Parse { details: String },

    #[error("[APP-002] Invalid manifest field '{field}': {reason}")]
    Invalid { field: String, reason: String },

    #[error("[APP-003] Unknown type '{type_name}' for input '{input}'")]
    UnknownInputType { input: String, type_name: String },

    #[error("[APP-004] Unknown type '{type_name}' for output '{output}'")]
    UnknownOutputType { output: String, type_name: String },

    #[error("[APP-005] Step {step} uses unknown tool '{tool}'")]
    UnknownTool { step: usize, tool: String },

    #[error("[APP-006] Step {step} uses '{tool}' but it is not declared in permissions")]
    UndeclaredPermission { step: usize, tool: String },

    #[error("[APP-007] Step {step} references unknown name '{{{{{name}}}}}'")]
    UnknownReference { step: usize, name: String },

    #[error("[APP-008] Step {step} has an invalid template: {details}")]
    Template { step: usize, details: String },

    #[error("[APP-009] Output key '{key}' of step {step} is already defined")]
    DuplicateOutput { step: usize, key: String },

    #[error("[APP-010] Missing required input '{name}'")]
    MissingInput { name: String },

    #[error("[APP-011] Unknown input '{name}'")]
    UnknownInput { name: String },

    #[error("[APP-012] Input '{name}' expected {expected}, got {actual}")]
    InputType {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("[APP-013] Input '{name}' must be one of: {allowed}")]
    InputNotAllowed { name: String, allowed: String },
}

impl ManifestError {
    /// Stable kind name reported to callers in a structured rejection
    pub fn kind(&self) -> &'static str {
        match self {
            ManifestError::UnknownReference { .. } => "UnknownReferenceError",
            ManifestError::MissingInput { .. }
            | ManifestError::UnknownInput { .. }
            | ManifestError::InputType { .. }
            | ManifestError::InputNotAllowed { .. } => "InvalidInputError",
            _ => "ValidationError",
        }
    }
}

impl FixSuggestion for ManifestError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            ManifestError::Parse { .. } => Some("Check the manifest JSON/YAML syntax"),
            ManifestError::Invalid { .. } => Some("Fix the field to match the manifest format"),
            ManifestError::UnknownInputType { .. } => Some(
                "Use one of: string, text, number, integer, boolean, url, email, enum, json",
            ),
            ManifestError::UnknownOutputType { .. } => Some(
                "Use one of: string, text, number, integer, boolean, json, url, image",
            ),
            ManifestError::UnknownTool { .. } => {
                Some("Run `apprun validate` to list the registered tools")
            }
            ManifestError::UndeclaredPermission { .. } => {
                Some("Add the tool id to the manifest's permissions list")
            }
            ManifestError::UnknownReference { .. } => Some(
                "Reference a declared input or an output of an earlier step, or add ||default",
            ),
            ManifestError::Template { .. } => Some("Use {{name}} or {{name||default}}"),
            ManifestError::DuplicateOutput { .. } => {
                Some("Give each step a unique output key")
            }
            ManifestError::MissingInput { .. } => {
                Some("Provide the input or declare a default in the manifest")
            }
            ManifestError::UnknownInput { .. } => Some("Remove inputs the manifest does not declare"),
            ManifestError::InputType { .. } => Some("Pass a value of the declared input type"),
            ManifestError::InputNotAllowed { .. } => {
                Some("Pick one of the values listed in the input's enum")
            }
        }
    }
}

// ═══════════════════════════════════════════
// CREDENTIAL ERRORS (020-029)
// ═══════════════════════════════════════════

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("[APP-020] No credential for permission '{permission}' (provider '{provider}')")]
    Missing {
        permission: String,
        provider: String,
    },

    #[error("[APP-021] Credential vault unavailable: {reason}")]
    Vault { reason: String },
}

// ═══════════════════════════════════════════
// TOKEN ERRORS (030-039)
// ═══════════════════════════════════════════

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("[APP-030] Token scoped to '{actual}' presented to the '{expected}' handler")]
    ScopeMismatch { expected: String, actual: String },

    #[error("[APP-031] Capability token for '{permission}' has expired")]
    Expired { permission: String },
}

// ═══════════════════════════════════════════
// TEMPLATE ERRORS (040-049)
// ═══════════════════════════════════════════

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("[APP-040] Template parse error at position {position}: {details}")]
    Parse { position: usize, details: String },

    #[error("[APP-041] Reference '{{{{{name}}}}}' has no value and no default")]
    Unresolved { name: String },
}

// ═══════════════════════════════════════════
// TOOL ERRORS (050-059)
// ═══════════════════════════════════════════

/// Shared failure taxonomy every handler normalizes downstream errors into
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("[APP-050] Tool call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("[APP-051] Provider rate limit reached")]
    RateLimited,

    #[error("[APP-052] Invalid tool input: {reason}")]
    InvalidInput { reason: String },

    #[error("[APP-053] Provider error: {reason}")]
    Provider { reason: String },

    #[error("[APP-054] Provider rejected the credential")]
    AuthFailed,

    #[error(transparent)]
    Token(#[from] TokenError),
}

impl ToolError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        ToolError::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Map a downstream HTTP status onto the taxonomy (body is never kept)
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            401 | 403 => ToolError::AuthFailed,
            429 => ToolError::RateLimited,
            400 | 404 | 413 | 422 => ToolError::InvalidInput {
                reason: format!("provider rejected request (HTTP {})", status.as_u16()),
            },
            code => ToolError::Provider {
                reason: format!("HTTP {}", code),
            },
        }
    }

    /// Map a transport failure; only the failure class is kept
    pub fn from_transport(err: &reqwest::Error, timeout_ms: u64) -> Self {
        if err.is_timeout() {
            ToolError::Timeout { timeout_ms }
        } else if err.is_connect() {
            ToolError::Provider {
                reason: "connection failed".to_string(),
            }
        } else if err.is_decode() {
            ToolError::Provider {
                reason: "malformed provider response".to_string(),
            }
        } else {
            ToolError::Provider {
                reason: "request failed".to_string(),
            }
        }
    }
}

// ═══════════════════════════════════════════
// QUOTA ERRORS (060-069)
// ═══════════════════════════════════════════

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("[APP-060] Run deadline of {limit_ms}ms reached")]
    Deadline { limit_ms: u64 },

    #[error("[APP-061] Token budget exhausted ({used}/{budget})")]
    TokenBudget { used: u64, budget: u64 },

    #[error("[APP-062] Outbound host '{host}' is not allowed: {reason}")]
    Network { host: String, reason: String },
}

// ═══════════════════════════════════════════
// STEP BOUNDARY
// ═══════════════════════════════════════════

/// Everything that can stop a step. Caught at the step boundary and
/// converted into a trace entry; never escapes a run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl From<TokenError> for StepError {
    fn from(err: TokenError) -> Self {
        StepError::Tool(ToolError::Token(err))
    }
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Credential(CredentialError::Missing { .. }) => ErrorKind::CredentialMissing,
            // Vault outage: the user may well have a key
            StepError::Credential(CredentialError::Vault { .. }) => ErrorKind::Provider,
            StepError::Quota(_) => ErrorKind::QuotaExceeded,
            StepError::Template(_) => ErrorKind::Template,
            StepError::Tool(tool) => match tool {
                ToolError::Timeout { .. } => ErrorKind::ToolTimeout,
                ToolError::RateLimited => ErrorKind::RateLimited,
                ToolError::InvalidInput { .. } => ErrorKind::InvalidInput,
                ToolError::Provider { .. } => ErrorKind::Provider,
                ToolError::AuthFailed => ErrorKind::AuthFailed,
                ToolError::Token(TokenError::ScopeMismatch { .. }) => ErrorKind::ScopeMismatch,
                ToolError::Token(TokenError::Expired { .. }) => ErrorKind::TokenExpired,
            },
        }
    }
}

/// Stable, redacted error classification recorded in the trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "CredentialMissingError")]
    CredentialMissing,
    #[serde(rename = "ScopeMismatchError")]
    ScopeMismatch,
    #[serde(rename = "TokenExpiredError")]
    TokenExpired,
    #[serde(rename = "ToolTimeoutError")]
    ToolTimeout,
    #[serde(rename = "RateLimitedError")]
    RateLimited,
    #[serde(rename = "InvalidInputError")]
    InvalidInput,
    #[serde(rename = "AuthFailedError")]
    AuthFailed,
    #[serde(rename = "ProviderError")]
    Provider,
    #[serde(rename = "QuotaExceededError")]
    QuotaExceeded,
    #[serde(rename = "TemplateError")]
    Template,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CredentialMissing => "CredentialMissingError",
            ErrorKind::ScopeMismatch => "ScopeMismatchError",
            ErrorKind::TokenExpired => "TokenExpiredError",
            ErrorKind::ToolTimeout => "ToolTimeoutError",
            ErrorKind::RateLimited => "RateLimitedError",
            ErrorKind::InvalidInput => "InvalidInputError",
            ErrorKind::AuthFailed => "AuthFailedError",
            ErrorKind::Provider => "ProviderError",
            ErrorKind::QuotaExceeded => "QuotaExceededError",
            ErrorKind::Template => "TemplateError",
        }
    }

    /// Executor invariant violations; never expected under correct operation
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, ErrorKind::ScopeMismatch | ErrorKind::TokenExpired)
    }

    /// Transient failures may leave a run `partial` instead of `failed`
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::ToolTimeout
                | ErrorKind::RateLimited
                | ErrorKind::Provider
                | ErrorKind::QuotaExceeded
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════
// TOP LEVEL (070-079)
// ═══════════════════════════════════════════

/// Errors returned by `run_app` and the CLI. Step failures are not errors
/// here: they end up as a terminated run.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("[APP-070] Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("[APP-071] IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[APP-072] Run store error: {reason}")]
    Store { reason: String },
}

impl FixSuggestion for RuntimeError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            RuntimeError::Manifest(e) => e.fix_suggestion(),
            RuntimeError::Config { .. } => {
                Some("Check ~/.config/apprun/config.toml and APPRUN_* environment variables")
            }
            RuntimeError::Io(_) => Some("Check file path and permissions"),
            RuntimeError::Store { .. } => Some("Check the run store backend is reachable"),
        }
    }
}
