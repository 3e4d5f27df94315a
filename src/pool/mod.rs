//! Concurrent fan-out of stage tasks across agent kinds.

pub mod coordinator;

pub use coordinator::{plan_tasks, AgentPoolCoordinator};
