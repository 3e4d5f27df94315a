//! lead-forge: concurrent lead-research pipeline.
//!
//! A run turns search intake into a consolidated lead list: queries are
//! fanned out across research agents under a concurrency limit, raw
//! findings pass a structuring/validation gate, and accepted records are
//! appended crash-safely to one JSON file per run.

// Core modules
pub mod agents;
pub mod cli;
pub mod config;
pub mod error;
pub mod intake;
pub mod llm;
pub mod metrics;
pub mod pool;
pub mod run;
pub mod stage;
pub mod store;
pub mod utils;
pub mod validation;
pub mod workspace;

// Re-export commonly used types
pub use config::ForgeConfig;
pub use error::{ErrorKind, LlmError};
pub use run::{RunController, RunId, RunReport, RunRequest, RunStatus};
