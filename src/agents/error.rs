//! Error types for research agents and structurers.

use thiserror::Error;

use super::types::AgentKind;
use crate::error::LlmError;

/// Errors raised by a research agent.
///
/// The stage executor folds every variant into a `provider_error` result.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The search or LLM provider behind the agent failed.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The agent answered, but not in a usable form.
    #[error("Failed to parse agent response: {0}")]
    ResponseParse(String),

    /// The agent does not serve this kind.
    #[error("Agent kind '{0}' is not supported")]
    Unsupported(AgentKind),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LlmError> for AgentError {
    fn from(err: LlmError) -> Self {
        AgentError::Provider(err.to_string())
    }
}

/// Errors raised by a structurer.
#[derive(Debug, Error)]
pub enum StructuringError {
    /// The payload (or the structurer's own output) is not usable lead data.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// The collaborator behind the structurer failed.
    #[error("Structuring provider error: {0}")]
    Provider(String),
}

impl From<LlmError> for StructuringError {
    fn from(err: LlmError) -> Self {
        StructuringError::Provider(err.to_string())
    }
}

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_error_maps_to_provider() {
        let err: AgentError = LlmError::RateLimited("slow down".to_string()).into();
        assert!(matches!(err, AgentError::Provider(ref msg) if msg.contains("slow down")));

        let err: StructuringError = LlmError::MissingApiKey.into();
        assert!(matches!(err, StructuringError::Provider(_)));
    }

    #[test]
    fn test_unsupported_display() {
        let err = AgentError::Unsupported(AgentKind::Gmap);
        assert_eq!(err.to_string(), "Agent kind 'gmap' is not supported");
    }
}
