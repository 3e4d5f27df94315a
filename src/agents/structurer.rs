//! Structurers turn raw payload items into JSON objects the validation gate
//! can map onto lead records.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::error::StructuringError;
use super::prompts::{structuring_user_prompt, STRUCTURING_PROMPT};
use super::types::RawPayload;
use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::stage::Attempt;
use crate::utils::json_extraction::parse_json_from_response;

/// Structuring collaborator.
///
/// Must be idempotent: the same payload and feedback give the same objects.
#[async_trait]
pub trait Structurer: Send + Sync {
    /// Structures `payload`. `feedback` describes why the previous attempt
    /// was rejected.
    async fn structure(
        &self,
        payload: &RawPayload,
        attempt: &Attempt,
        feedback: Option<&str>,
    ) -> Result<Vec<Map<String, Value>>, StructuringError>;
}

/// Deterministic structurer with no external collaborator.
///
/// Objects pass through, wrapper objects and lists are flattened, and
/// strings are searched for embedded JSON. Anything else is malformed.
#[derive(Debug, Clone, Default)]
pub struct PassthroughStructurer;

impl PassthroughStructurer {
    /// Creates a passthrough structurer.
    pub fn new() -> Self {
        Self
    }

    fn collect(value: &Value, out: &mut Vec<Map<String, Value>>) -> Result<(), StructuringError> {
        match value {
            Value::Object(map) => {
                let nested = ["leads", "results"]
                    .iter()
                    .find_map(|key| map.get(*key).and_then(Value::as_array));
                match nested {
                    Some(items) => {
                        for item in items {
                            Self::collect(item, out)?;
                        }
                    }
                    None => out.push(map.clone()),
                }
                Ok(())
            }
            Value::Array(items) => {
                for item in items {
                    Self::collect(item, out)?;
                }
                Ok(())
            }
            Value::String(text) => {
                let parsed = parse_json_from_response(text)
                    .map_err(|e| StructuringError::Malformed(e.to_string()))?;
                if parsed.is_string() {
                    return Err(StructuringError::Malformed(
                        "text item holds no JSON object".to_string(),
                    ));
                }
                Self::collect(&parsed, out)
            }
            other => Err(StructuringError::Malformed(format!(
                "expected an object, got {}",
                json_type_name(other)
            ))),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl Structurer for PassthroughStructurer {
    async fn structure(
        &self,
        payload: &RawPayload,
        _attempt: &Attempt,
        _feedback: Option<&str>,
    ) -> Result<Vec<Map<String, Value>>, StructuringError> {
        let mut out = Vec::new();
        for item in payload.items() {
            Self::collect(item, &mut out)?;
        }
        Ok(out)
    }
}

/// Structurer that asks an LLM to normalize the payload into a lead list.
pub struct LlmStructurer {
    llm_client: Arc<dyn LlmProvider>,
    model: String,
    max_tokens: u32,
}

impl std::fmt::Debug for LlmStructurer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmStructurer")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

impl LlmStructurer {
    /// Creates a structurer using `model` (empty means the client's default).
    pub fn new(llm_client: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            llm_client,
            model: model.into(),
            max_tokens: 4000,
        }
    }

    /// Sets the answer token limit.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl Structurer for LlmStructurer {
    async fn structure(
        &self,
        payload: &RawPayload,
        attempt: &Attempt,
        feedback: Option<&str>,
    ) -> Result<Vec<Map<String, Value>>, StructuringError> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }

        let raw = serde_json::to_string_pretty(&payload.to_value())
            .map_err(|e| StructuringError::Malformed(e.to_string()))?;

        let request = GenerationRequest::new(
            self.model.clone(),
            vec![
                Message::system(STRUCTURING_PROMPT),
                Message::user(structuring_user_prompt(&raw, feedback)),
            ],
        )
        .with_temperature(0.0)
        .with_max_tokens(self.max_tokens)
        .with_json_output();

        tracing::debug!(attempt = %attempt, items = payload.len(), "Structuring payload");

        let response = self.llm_client.generate(request).await?;
        let content = response
            .first_content()
            .ok_or_else(|| StructuringError::Malformed("empty response".to_string()))?;

        let value = parse_json_from_response(content)
            .map_err(|e| StructuringError::Malformed(e.to_string()))?;

        let leads = match &value {
            Value::Object(map) => map.get("leads").and_then(Value::as_array),
            Value::Array(items) => Some(items),
            _ => None,
        }
        .ok_or_else(|| StructuringError::Malformed("answer has no \"leads\" list".to_string()))?;

        leads
            .iter()
            .map(|lead| match lead {
                Value::Object(map) => Ok(map.clone()),
                other => Err(StructuringError::Malformed(format!(
                    "lead entry is {}, not an object",
                    json_type_name(other)
                ))),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::GenerationResponse;
    use serde_json::json;

    struct FixedLlm(&'static str);

    #[async_trait]
    impl LlmProvider for FixedLlm {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            Ok(GenerationResponse::from_text(self.0))
        }
    }

    #[tokio::test]
    async fn test_passthrough_flattens_wrappers() {
        let payload = RawPayload::from_value(json!({
            "results": [{"name": "A"}, {"leads": [{"name": "B"}]}, [{"name": "C"}]]
        }));

        let maps = PassthroughStructurer::new()
            .structure(&payload, &Attempt::first(3), None)
            .await
            .expect("structure");

        let names: Vec<_> = maps.iter().map(|m| m["name"].clone()).collect();
        assert_eq!(names, vec![json!("A"), json!("B"), json!("C")]);
    }

    #[tokio::test]
    async fn test_passthrough_extracts_json_from_text() {
        let payload =
            RawPayload::SingleItem(json!("Found: {\"company\": \"Acme\", \"phone\": \"512 555 0100\"}"));

        let maps = PassthroughStructurer::new()
            .structure(&payload, &Attempt::first(3), None)
            .await
            .expect("structure");
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0]["company"], "Acme");
    }

    #[tokio::test]
    async fn test_passthrough_rejects_garbage() {
        let payload = RawPayload::SingleItem(json!("<html>not a lead</html>"));
        let err = PassthroughStructurer::new()
            .structure(&payload, &Attempt::first(3), None)
            .await
            .expect_err("malformed");
        assert!(matches!(err, StructuringError::Malformed(_)));

        let payload = RawPayload::ItemList(vec![json!(42)]);
        let err = PassthroughStructurer::new()
            .structure(&payload, &Attempt::first(3), None)
            .await
            .expect_err("malformed");
        assert!(err.to_string().contains("number"));
    }

    #[tokio::test]
    async fn test_llm_structurer_reads_lead_list() {
        let structurer = LlmStructurer::new(
            Arc::new(FixedLlm(
                r#"{"leads":[{"company":"Acme","website":"acme.com","mail":"unknown"}]}"#,
            )),
            "m",
        );
        let payload = RawPayload::SingleItem(json!("Acme at acme.com"));

        let maps = structurer
            .structure(&payload, &Attempt::first(3), None)
            .await
            .expect("structure");
        assert_eq!(maps[0]["website"], "acme.com");
    }

    #[tokio::test]
    async fn test_llm_structurer_rejects_missing_list() {
        let structurer = LlmStructurer::new(Arc::new(FixedLlm(r#"{"company":"Acme"}"#)), "m");
        let payload = RawPayload::SingleItem(json!("Acme"));

        let err = structurer
            .structure(&payload, &Attempt::first(3), Some("previous answer was empty"))
            .await
            .expect_err("no leads list");
        assert!(matches!(err, StructuringError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_llm_structurer_skips_empty_payload() {
        let structurer = LlmStructurer::new(Arc::new(FixedLlm("unused")), "m");
        let payload = RawPayload::Wrapped {
            key: "results".to_string(),
            items: vec![],
        };
        let maps = structurer
            .structure(&payload, &Attempt::first(3), None)
            .await
            .expect("structure");
        assert!(maps.is_empty());
    }
}
