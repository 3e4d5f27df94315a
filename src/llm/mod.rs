//! LLM integration for lead-forge.
//!
//! Research agents, the structuring collaborator and the intake planner
//! share one OpenAI-compatible client behind the [`LlmProvider`] trait.
//!
//! ```ignore
//! use lead_forge::llm::{GenerationRequest, LiteLlmClient, LlmProvider, Message};
//!
//! let client = LiteLlmClient::from_env()?;
//! let request = GenerationRequest::new("", vec![Message::user("hello")]);
//! let response = client.generate(request).await?;
//! ```

pub mod litellm;

pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message,
    ResponseFormat, Role, Usage,
    DEFAULT_MODEL, OPENROUTER_API_BASE,
};
