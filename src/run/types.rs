//! Run identity, status and reporting types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agents::AgentKind;
use crate::error::ErrorKind;
use crate::intake::IntakeConstraints;
use crate::stage::{StageError, StageTask, TaskId};

/// Errors returned by run submission and registry lookups.
#[derive(Debug, Error)]
pub enum RunError {
    /// A run with this ID is registered or its workspace already exists.
    #[error("Run '{0}' already exists")]
    AlreadyExists(RunId),

    /// No run with this ID is registered.
    #[error("Run '{0}' not found")]
    NotFound(RunId),

    /// The run has not reached a terminal state yet.
    #[error("Run '{0}' is still {1}")]
    NotTerminal(RunId, RunStatus),

    /// The task driving the run ended abnormally.
    #[error("Run task aborted: {0}")]
    Aborted(String),
}

/// Error for run IDs that could escape the runs directory or are malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid run ID '{value}': {reason}")]
pub struct InvalidRunId {
    pub value: String,
    pub reason: &'static str,
}

/// Immutable run identifier, also the run's directory name.
///
/// Generated IDs look like `run_20261018T101500_1a2b3c4d`. Parsed IDs may be
/// any non-empty string of ASCII letters, digits, `_` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Generates a fresh run ID from the current time and a random suffix.
    pub fn generate() -> Self {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        RunId(format!("run_{}_{}", stamp, &suffix[..8]))
    }

    /// Validates and wraps `value`.
    pub fn parse(value: impl Into<String>) -> Result<Self, InvalidRunId> {
        let value = value.into();
        let reason = if value.is_empty() {
            Some("must not be empty")
        } else if value.len() > 128 {
            Some("must be at most 128 characters")
        } else if value.starts_with('.') {
            Some("must not start with '.'")
        } else if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            Some("only ASCII letters, digits, '_' and '-' are allowed")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(InvalidRunId { value, reason }),
            None => Ok(RunId(value)),
        }
    }

    /// The ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunId {
    type Err = InvalidRunId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunId::parse(s)
    }
}

impl TryFrom<String> for RunId {
    type Error = InvalidRunId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RunId::parse(value)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    PartiallyFailed,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    /// Returns true for states a run never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::PartiallyFailed
                | RunStatus::Completed
                | RunStatus::Cancelled
                | RunStatus::Failed
        )
    }

    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::PartiallyFailed => "partially_failed",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a run as held by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub workspace: PathBuf,
    pub cancel_requested: bool,
}

impl Run {
    /// A freshly submitted run.
    pub fn pending(id: RunId, workspace: PathBuf) -> Self {
        Self {
            id,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            finished_at: None,
            workspace,
            cancel_requested: false,
        }
    }
}

/// Where a run's queries come from.
#[derive(Debug, Clone)]
pub enum QuerySource {
    /// Explicit search queries, used as given.
    Queries(Vec<String>),
    /// Intake constraints planned into queries.
    Constraints(IntakeConstraints),
}

/// Request to start a run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Fixed run ID; generated when absent.
    pub run_id: Option<RunId>,
    pub source: QuerySource,
}

impl RunRequest {
    /// Run over explicit queries.
    pub fn from_queries<I, S>(queries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            run_id: None,
            source: QuerySource::Queries(queries.into_iter().map(Into::into).collect()),
        }
    }

    /// Run planned from intake constraints.
    pub fn from_constraints(constraints: IntakeConstraints) -> Self {
        Self {
            run_id: None,
            source: QuerySource::Constraints(constraints),
        }
    }

    /// Fixes the run ID.
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// One entry of a run's error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    /// Originating task, absent for run-level failures.
    pub task_id: Option<TaskId>,
    pub agent: Option<AgentKind>,
    pub query: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    /// Structuring attempts spent on the task.
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

impl ErrorLogEntry {
    /// Run-level failure not tied to a task.
    pub fn run_level(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            task_id: None,
            agent: None,
            query: None,
            kind,
            message: message.into(),
            attempts: 0,
            at: Utc::now(),
        }
    }

    /// Failure of one stage task.
    pub fn for_task(task: &StageTask, error: &StageError, attempts: u32) -> Self {
        Self {
            task_id: Some(task.id),
            agent: Some(task.agent),
            query: Some(task.query.text.clone()),
            kind: error.kind,
            message: error.message.clone(),
            attempts,
            at: Utc::now(),
        }
    }
}

/// Counters describing a finished run; persisted as `pipeline_metrics.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_queries: usize,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub records_consolidated: usize,
    pub records_with_contact: usize,
    pub elapsed_secs: f64,
}

/// Final outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run: Run,
    pub summary: RunSummary,
    pub errors: Vec<ErrorLogEntry>,
    pub consolidated_path: PathBuf,
}

impl RunReport {
    /// Number of error log entries of `kind`.
    pub fn count_errors(&self, kind: ErrorKind) -> usize {
        self.errors.iter().filter(|e| e.kind == kind).count()
    }
}
