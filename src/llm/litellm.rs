//! OpenAI-compatible chat-completions client.
//!
//! Works against LiteLLM proxies and OpenRouter. The research agents, the
//! structuring collaborator and the intake planner all talk to an LLM
//! through the [`LlmProvider`] trait so tests can substitute scripted
//! providers.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::LlmError;

/// Default OpenRouter endpoint.
pub const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";

/// Default model used for research, structuring and intake.
pub const DEFAULT_MODEL: &str = "openai/gpt-4.1-mini";

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MAX_RETRIES: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    #[serde(other)]
    Other,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// Providers send `null` content for refusals and tool calls; it reads as empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// `response_format` body field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

/// Chat-completions request body.
///
/// An empty `model` is replaced by the client's default model when sent.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            response_format: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Asks the provider for a JSON object answer.
    pub fn with_json_output(mut self) -> Self {
        self.response_format = Some(ResponseFormat {
            kind: "json_object",
        });
        self
    }
}

/// Chat-completions response.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

impl GenerationResponse {
    /// Single-choice response carrying `content`; used by scripted providers.
    pub fn from_text(content: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            model: String::new(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(content),
                finish_reason: Some("stop".to_string()),
            }],
            usage: Usage::default(),
        }
    }

    /// Content of the first choice.
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Anything that answers chat-completions requests.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Maps a non-success HTTP answer onto an error, preferring the provider's
/// own message over the raw body.
fn status_error(status: StatusCode, body: String) -> LlmError {
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error.message)
        .unwrap_or(body);
    if status == StatusCode::TOO_MANY_REQUESTS {
        LlmError::RateLimited(message)
    } else {
        LlmError::ApiError {
            code: status.as_u16(),
            message,
        }
    }
}

/// Rate limits, server errors and transport failures are worth another try.
fn is_transient(error: &LlmError) -> bool {
    match error {
        LlmError::RateLimited(_) | LlmError::RequestFailed(_) => true,
        LlmError::ApiError { code, .. } => *code >= 500,
        _ => false,
    }
}

/// Client for LiteLLM-compatible APIs.
#[derive(Debug, Clone)]
pub struct LiteLlmClient {
    api_base: String,
    api_key: Option<String>,
    default_model: String,
    max_retries: u32,
    http_client: Client,
}

impl LiteLlmClient {
    /// Creates a client for `api_base` (e.g. `http://localhost:4000`).
    /// `default_model` is used when a request leaves `model` empty.
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let http_client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| LlmError::ClientBuild(e.to_string()))?;

        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            default_model: default_model.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            http_client,
        })
    }

    /// Creates a client pre-configured for OpenRouter.
    pub fn new_with_defaults(api_key: String) -> Result<Self, LlmError> {
        Self::new(OPENROUTER_API_BASE, Some(api_key), DEFAULT_MODEL)
    }

    /// Creates a client from `LITELLM_API_BASE`, `OPENROUTER_API_KEY` (or
    /// `LITELLM_API_KEY`) and `LITELLM_DEFAULT_MODEL`. Only the key is required.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_base =
            env::var("LITELLM_API_BASE").unwrap_or_else(|_| OPENROUTER_API_BASE.to_string());
        let api_key = env::var("OPENROUTER_API_KEY")
            .or_else(|_| env::var("LITELLM_API_KEY"))
            .map_err(|_| LlmError::MissingApiKey)?;
        let default_model =
            env::var("LITELLM_DEFAULT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        Self::new(api_base, Some(api_key), default_model)
    }

    /// Sets how often transient failures are retried.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    async fn send_once(&self, request: &GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let mut http_request = self
            .http_client
            .post(format!("{}/chat/completions", self.api_base))
            .header("X-Title", "lead-forge")
            .json(request);
        if let Some(api_key) = &self.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        let response = http_request
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("unreadable error body: {}", e));
            return Err(status_error(status, body));
        }

        response
            .json::<GenerationResponse>()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))
    }
}

#[async_trait]
impl LlmProvider for LiteLlmClient {
    async fn generate(
        &self,
        mut request: GenerationRequest,
    ) -> Result<GenerationResponse, LlmError> {
        if request.model.is_empty() {
            request.model = self.default_model.clone();
        }

        let mut retries = 0;
        loop {
            match self.send_once(&request).await {
                Err(e) if is_transient(&e) && retries < self.max_retries => {
                    retries += 1;
                    tracing::warn!(
                        model = %request.model,
                        retry = retries,
                        error = %e,
                        "LLM call failed, retrying"
                    );
                    tokio::time::sleep(RETRY_BACKOFF * retries).await;
                }
                other => return other,
            }
        }
    }
}
