//! Error types shared across lead-forge subsystems.
//!
//! Defines the run-level error taxonomy and the errors raised by the
//! LLM client. Subsystem-specific errors live next to their subsystem:
//! - Workspace allocation (`workspace::WorkspaceError`)
//! - Consolidated file persistence (`store::StoreError`)
//! - Intake planning (`intake::IntakeError`)
//! - Research and structuring collaborators (`agents::AgentError`, `agents::StructuringError`)
//! - Configuration (`config::ConfigError`)

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of every failure a run can record.
///
/// `Timeout`, `Cancelled`, `ProviderError` and `Invalid` are local to one
/// stage task. `IoFailure` is fatal for the run that hit it, and
/// `AlreadyExists` is a submission-time rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The stage did not finish before its deadline.
    Timeout,
    /// The run was cancelled before or while the stage executed.
    Cancelled,
    /// The research agent failed.
    ProviderError,
    /// Structuring/validation exhausted its retries.
    Invalid,
    /// Workspace or storage failure.
    IoFailure,
    /// Workspace collision at submission.
    AlreadyExists,
}

impl ErrorKind {
    /// Returns true if this kind ends the whole run rather than one task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::IoFailure)
    }

    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::Invalid => "invalid",
            ErrorKind::IoFailure => "io_failure",
            ErrorKind::AlreadyExists => "already_exists",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: set OPENROUTER_API_KEY or LITELLM_API_KEY")]
    MissingApiKey,

    #[error("HTTP client could not be built: {0}")]
    ClientBuild(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}
