//! Durable storage of run outputs.
//!
//! - [`atomic`]: temp-file + fsync + rename writes with bounded backups
//! - [`consolidated`]: the per-run consolidated lead list

pub mod atomic;
pub mod consolidated;

use std::path::PathBuf;

use thiserror::Error;

pub use atomic::{write_json_atomic, BackupPolicy};
pub use consolidated::{ConsolidatedFile, ConsolidationStore, CONSOLIDATED_FILE};

/// Errors raised while persisting run outputs.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to replace {path}: {message}")]
    Persist { path: PathBuf, message: String },

    #[error("Corrupt file {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Storage task failed: {0}")]
    Join(String),
}
