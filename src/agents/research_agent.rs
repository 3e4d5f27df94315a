//! Research agents: one call per (agent kind, query) pair.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::error::{AgentError, AgentResult};
use super::prompts::research_prompt;
use super::types::{AgentKind, RawPayload};
use crate::intake::Query;
use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::utils::json_extraction::parse_json_from_response;

/// Collaborator that researches one query for one agent kind.
///
/// Implementations may fail, hang or panic; the stage executor contains all
/// three.
#[async_trait]
pub trait ResearchAgent: Send + Sync {
    /// Returns the raw findings for `query`.
    async fn research(&self, kind: AgentKind, query: &Query) -> AgentResult<RawPayload>;
}

/// Configuration for the LLM research agent.
#[derive(Debug, Clone)]
pub struct LlmResearchConfig {
    /// Model name (empty means the client's default).
    pub model: String,
    /// Temperature for research calls.
    pub temperature: f64,
    /// Maximum tokens per answer.
    pub max_tokens: u32,
}

impl Default for LlmResearchConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.2,
            max_tokens: 4000,
        }
    }
}

/// Research agent backed by an OpenAI-compatible LLM.
///
/// Answers that contain no parseable JSON are kept as a text
/// [`RawPayload::SingleItem`] so the structuring step can still try them.
pub struct LlmResearchAgent {
    llm_client: Arc<dyn LlmProvider>,
    config: LlmResearchConfig,
}

impl std::fmt::Debug for LlmResearchAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmResearchAgent")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LlmResearchAgent {
    /// Creates a new research agent.
    pub fn new(llm_client: Arc<dyn LlmProvider>, config: LlmResearchConfig) -> Self {
        Self { llm_client, config }
    }

    /// Creates a research agent with default settings.
    pub fn with_defaults(llm_client: Arc<dyn LlmProvider>) -> Self {
        Self::new(llm_client, LlmResearchConfig::default())
    }
}

#[async_trait]
impl ResearchAgent for LlmResearchAgent {
    async fn research(&self, kind: AgentKind, query: &Query) -> AgentResult<RawPayload> {
        let request = GenerationRequest::new(
            self.config.model.clone(),
            vec![
                Message::system(research_prompt(kind)),
                Message::user(format!("Search query: {}", query.text)),
            ],
        )
        .with_temperature(self.config.temperature)
        .with_max_tokens(self.config.max_tokens);

        let response = self.llm_client.generate(request).await?;
        let content = response
            .first_content()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AgentError::ResponseParse("empty response".to_string()))?;

        match parse_json_from_response(content) {
            Ok(value) => Ok(RawPayload::from_value(value)),
            Err(e) => {
                tracing::debug!(agent = %kind, query = %query, error = %e, "Agent answer is not JSON");
                Ok(RawPayload::SingleItem(Value::String(content.to_string())))
            }
        }
    }
}
