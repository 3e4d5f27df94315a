//! Command-line interface for lead-forge.
//!
//! Provides commands for executing runs and inspecting or purging run
//! workspaces.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
