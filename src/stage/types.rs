//! Stage task and result types.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agents::{AgentKind, RawPayload};
use crate::error::ErrorKind;
use crate::intake::Query;

/// Identifier of a stage task, unique within one fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Bounded retry state of a stage task.
///
/// `number` starts at 1 and never exceeds `max`; [`Attempt::next`] returns
/// `None` once the cap is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    number: u32,
    max: u32,
}

impl Attempt {
    /// First attempt out of `max` (at least one).
    pub fn first(max: u32) -> Self {
        Self {
            number: 1,
            max: max.max(1),
        }
    }

    /// The following attempt, if the cap allows one.
    pub fn next(&self) -> Option<Attempt> {
        (self.number < self.max).then(|| Attempt {
            number: self.number + 1,
            max: self.max,
        })
    }

    /// 1-based attempt number.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Attempt cap.
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Returns true if no further attempt is allowed.
    pub fn is_last(&self) -> bool {
        self.number >= self.max
    }
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.number, self.max)
    }
}

/// One (agent kind, query) unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTask {
    pub id: TaskId,
    pub agent: AgentKind,
    pub query: Query,
    pub attempt: Attempt,
}

impl StageTask {
    /// Creates a task on its first attempt.
    pub fn new(id: TaskId, agent: AgentKind, query: Query, max_attempts: u32) -> Self {
        Self {
            id,
            agent,
            query,
            attempt: Attempt::first(max_attempts),
        }
    }
}

/// Structured failure of one stage task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    /// Creates a stage error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Cancellation error.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "run cancelled")
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Terminal outcome of a stage task.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The agent returned a payload.
    Payload(RawPayload),
    /// The task failed.
    Failed(StageError),
}

/// Terminal result of exactly one stage task.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub task: StageTask,
    pub outcome: StageOutcome,
    pub elapsed: Duration,
}

impl StageResult {
    /// Successful result.
    pub fn payload(task: StageTask, payload: RawPayload, elapsed: Duration) -> Self {
        Self {
            task,
            outcome: StageOutcome::Payload(payload),
            elapsed,
        }
    }

    /// Failed result.
    pub fn failed(task: StageTask, error: StageError, elapsed: Duration) -> Self {
        Self {
            task,
            outcome: StageOutcome::Failed(error),
            elapsed,
        }
    }

    /// Result for a task cancelled before or while running.
    pub fn cancelled(task: StageTask, elapsed: Duration) -> Self {
        Self::failed(task, StageError::cancelled(), elapsed)
    }

    /// Returns true if the agent produced a payload.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StageOutcome::Payload(_))
    }

    /// Error kind, if the task failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            StageOutcome::Payload(_) => None,
            StageOutcome::Failed(err) => Some(err.kind),
        }
    }

    /// Outcome label for logs and metrics.
    pub fn outcome_label(&self) -> &'static str {
        match &self.outcome {
            StageOutcome::Payload(_) => "success",
            StageOutcome::Failed(err) => err.kind.as_str(),
        }
    }
}
