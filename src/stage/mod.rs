//! Stage tasks and their executor.

pub mod executor;
pub mod types;

pub use executor::StageExecutor;
pub use types::{Attempt, StageError, StageOutcome, StageResult, StageTask, TaskId};
