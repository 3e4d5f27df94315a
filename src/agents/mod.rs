//! Research agents and structuring collaborators.
//!
//! Both are external collaborators modelled as traits:
//! - [`ResearchAgent`] researches one query for one [`AgentKind`] and returns a [`RawPayload`]
//! - [`Structurer`] turns a raw payload into JSON objects for the validation gate
//!
//! LLM-backed implementations are provided for both, plus the deterministic
//! [`PassthroughStructurer`].

pub mod error;
pub mod prompts;
pub mod research_agent;
pub mod structurer;
pub mod types;

pub use error::{AgentError, AgentResult, StructuringError};
pub use research_agent::{LlmResearchAgent, LlmResearchConfig, ResearchAgent};
pub use structurer::{LlmStructurer, PassthroughStructurer, Structurer};
pub use types::{AgentKind, RawPayload};
