//! Runs: identity, lifecycle and the controller driving them.
//!
//! - [`types`]: `RunId`, `RunStatus`, requests and reports
//! - [`registry`]: the explicit run registry
//! - [`progress`]: progress counters and the snapshot writer
//! - [`controller`]: the run controller

pub mod controller;
pub mod progress;
pub mod registry;
pub mod types;

pub use controller::{RunController, RunHandle, ERRORS_FILE, METRICS_FILE};
pub use progress::{ProgressCounters, ProgressMonitor, ProgressSnapshot, PROGRESS_FILE};
pub use registry::RunRegistry;
pub use types::{
    ErrorLogEntry, InvalidRunId, QuerySource, Run, RunError, RunId, RunReport, RunRequest,
    RunStatus, RunSummary,
};
