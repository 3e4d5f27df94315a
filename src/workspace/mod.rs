//! Run workspaces: one isolated, lock-protected directory tree per run.

pub mod manager;

pub use manager::{
    outputs_dir, run_dir, Workspace, WorkspaceError, WorkspaceManager, INPUTS_DIR, LOCK_FILE,
    OUTPUTS_DIR,
};
