//! Intake: turning lead constraints into search queries.
//!
//! A run starts either from explicit queries or from an intake document
//! (project, targets, personas...). Intake documents are planned into 3–5
//! short lowercase keyword queries by a [`QueryPlanner`]:
//!
//! - [`KeywordQueryPlanner`] mixes fixed query angles deterministically.
//! - [`LlmQueryPlanner`] asks an LLM at temperature 0 and normalizes its answer.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::utils::json_extraction::parse_json_from_response;

/// Minimum number of queries a plan must yield.
pub const MIN_PLANNED_QUERIES: usize = 3;
/// Maximum number of queries a plan may yield.
pub const MAX_PLANNED_QUERIES: usize = 5;

const MIN_QUERY_WORDS: usize = 3;
const MAX_QUERY_WORDS: usize = 8;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "at", "by", "for", "from", "in", "of", "on", "or", "the", "to", "with",
];

/// System prompt for query planning.
const QUERY_PLANNER_SYSTEM_PROMPT: &str = r#"You generate simple, broad web search queries from the provided lead intake JSON.

Input JSON structure:
- project
- entity_type
- targets: entity_subtype, locations, industries, company_sizes, keywords
- personas: roles, seniority
- constraints
- verification
- seeds

Goal:
Produce concise search queries that collect many potential leads without becoming too specific.

Rules:
- Return 3 to 5 queries.
- Each query must be 3 to 8 meaningful keywords.
- Use plain lowercase words only. No quotes, boolean operators, punctuation, or special symbols.
- Avoid stopwords like "the", "and", "of".
- Build queries only from entity_subtype, locations, industries, keywords and personas.roles (optional, for one query).

Query angles to mix:
1. entity_subtype + location
2. entity_subtype + industry + location
3. keyword + entity_subtype + location
4. role + entity_subtype + location
5. keyword + location

You MUST respond with ONLY a valid JSON object in this exact format:
{"queries": ["query1", "query2", "query3"]}"#;

/// Errors that can occur while planning queries.
#[derive(Debug, Error)]
pub enum IntakeError {
    /// The constraints carry nothing usable, or the plan is out of bounds.
    #[error("Invalid intake constraints: {0}")]
    InvalidConstraints(String),

    /// The planning collaborator failed.
    #[error("Query planner provider error: {0}")]
    Provider(String),

    /// The planner answered, but not with a query list.
    #[error("Failed to parse query plan: {0}")]
    ResponseParse(String),
}

impl From<crate::error::LlmError> for IntakeError {
    fn from(err: crate::error::LlmError) -> Self {
        IntakeError::Provider(err.to_string())
    }
}

/// One optimized search string. Order only affects scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    /// Position in the run's query list.
    pub index: usize,
    /// The search text.
    pub text: String,
}

impl Query {
    /// Creates a query.
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
        }
    }

    /// Indexes a list of query texts, dropping blank entries.
    pub fn from_texts<I, S>(texts: I) -> Vec<Query>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        texts
            .into_iter()
            .map(|t| t.as_ref().trim().to_string())
            .filter(|t| !t.is_empty())
            .enumerate()
            .map(|(index, text)| Query { index, text })
            .collect()
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// A field that may be given as one string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<OneOrMany>::deserialize(deserializer)?;
    Ok(match value {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

/// Who the run is looking for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntakeTargets {
    #[serde(default, deserialize_with = "one_or_many")]
    pub entity_subtype: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub locations: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub industries: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub company_sizes: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub keywords: Vec<String>,
}

/// Contact personas of interest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntakePersonas {
    #[serde(default, deserialize_with = "one_or_many")]
    pub roles: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub seniority: Vec<String>,
}

/// User intake document a run can be planned from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntakeConstraints {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub targets: IntakeTargets,
    #[serde(default)]
    pub personas: IntakePersonas,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub constraints: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub verification: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub seeds: Value,
}

impl IntakeConstraints {
    /// Returns true if at least one field queries can be built from is set.
    pub fn has_usable_fields(&self) -> bool {
        let t = &self.targets;
        [
            &t.entity_subtype,
            &t.locations,
            &t.industries,
            &t.keywords,
            &self.personas.roles,
        ]
        .iter()
        .any(|field| field.iter().any(|v| !v.trim().is_empty()))
    }

    fn ensure_usable(&self) -> Result<(), IntakeError> {
        if self.has_usable_fields() {
            Ok(())
        } else {
            Err(IntakeError::InvalidConstraints(
                "no entity_subtype, locations, industries, keywords or roles given".to_string(),
            ))
        }
    }
}

/// Collaborator that plans search queries from intake constraints.
///
/// Implementations must be deterministic for identical constraints.
#[async_trait]
pub trait QueryPlanner: Send + Sync {
    /// Plans 3–5 queries.
    async fn plan(&self, constraints: &IntakeConstraints) -> Result<Vec<Query>, IntakeError>;
}

/// Lowercases, strips punctuation and stopwords, drops repeated words and
/// caps the query at 8 words.
pub fn normalize_query(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();

    let mut seen = HashSet::new();
    cleaned
        .split_whitespace()
        .filter(|w| !STOPWORDS.contains(w))
        .filter(|w| seen.insert(w.to_string()))
        .take(MAX_QUERY_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalizes, dedupes and bounds a planned query list.
fn finalize_plan<I>(candidates: I) -> Result<Vec<Query>, IntakeError>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    let texts: Vec<String> = candidates
        .into_iter()
        .map(|c| normalize_query(&c))
        .filter(|q| q.split_whitespace().count() >= MIN_QUERY_WORDS)
        .filter(|q| seen.insert(q.clone()))
        .take(MAX_PLANNED_QUERIES)
        .collect();

    if texts.len() < MIN_PLANNED_QUERIES {
        return Err(IntakeError::InvalidConstraints(format!(
            "plan yielded {} usable queries, need at least {}",
            texts.len(),
            MIN_PLANNED_QUERIES
        )));
    }

    Ok(Query::from_texts(texts))
}

/// Deterministic planner mixing fixed query angles.
#[derive(Debug, Clone, Default)]
pub struct KeywordQueryPlanner;

impl KeywordQueryPlanner {
    /// Creates a keyword planner.
    pub fn new() -> Self {
        Self
    }

    fn candidates(constraints: &IntakeConstraints) -> Vec<String> {
        let t = &constraints.targets;
        let pick = |values: &[String], i: usize| -> Option<String> {
            let values: Vec<&String> = values.iter().filter(|v| !v.trim().is_empty()).collect();
            if values.is_empty() {
                None
            } else {
                Some(values[i % values.len()].clone())
            }
        };

        let rounds = t.locations.len().max(1);
        let mut out = Vec::new();

        for i in 0..rounds {
            let subtype = pick(&t.entity_subtype, i);
            let location = pick(&t.locations, i);
            let industry = pick(&t.industries, i);
            let keyword = pick(&t.keywords, i);
            let role = pick(&constraints.personas.roles, i);

            let angles = [
                vec![subtype.clone(), location.clone()],
                vec![subtype.clone(), industry, location.clone()],
                vec![keyword.clone(), subtype.clone(), location.clone()],
                vec![role, subtype, location.clone()],
                vec![keyword, location],
            ];

            out.extend(angles.into_iter().map(|parts| {
                parts
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ")
            }));
        }

        out
    }
}

#[async_trait]
impl QueryPlanner for KeywordQueryPlanner {
    async fn plan(&self, constraints: &IntakeConstraints) -> Result<Vec<Query>, IntakeError> {
        constraints.ensure_usable()?;
        finalize_plan(Self::candidates(constraints))
    }
}

/// Planner backed by an LLM.
pub struct LlmQueryPlanner {
    llm_client: Arc<dyn LlmProvider>,
    model: String,
}

impl std::fmt::Debug for LlmQueryPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmQueryPlanner")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct QueryPlanResponse {
    queries: Vec<String>,
}

impl LlmQueryPlanner {
    /// Creates a planner using `model` (empty means the client's default).
    pub fn new(llm_client: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            llm_client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl QueryPlanner for LlmQueryPlanner {
    async fn plan(&self, constraints: &IntakeConstraints) -> Result<Vec<Query>, IntakeError> {
        constraints.ensure_usable()?;

        let input = serde_json::to_string_pretty(constraints)
            .map_err(|e| IntakeError::InvalidConstraints(e.to_string()))?;

        let request = GenerationRequest::new(
            self.model.clone(),
            vec![
                Message::system(QUERY_PLANNER_SYSTEM_PROMPT),
                Message::user(input),
            ],
        )
        .with_temperature(0.0)
        .with_max_tokens(500)
        .with_json_output();

        let response = self.llm_client.generate(request).await?;
        let content = response
            .first_content()
            .ok_or_else(|| IntakeError::ResponseParse("empty response".to_string()))?;

        let value =
            parse_json_from_response(content).map_err(|e| IntakeError::ResponseParse(e.to_string()))?;
        let plan: QueryPlanResponse =
            serde_json::from_value(value).map_err(|e| IntakeError::ResponseParse(e.to_string()))?;

        tracing::debug!(raw_queries = plan.queries.len(), "Query plan received");
        finalize_plan(plan.queries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::GenerationResponse;

    fn dental_constraints() -> IntakeConstraints {
        serde_json::from_value(serde_json::json!({
            "project": "Clinic outreach",
            "entity_type": "company",
            "targets": {
                "entity_subtype": "dental clinic",
                "locations": ["Austin, TX", "Dallas"],
                "industries": ["healthcare"],
                "keywords": ["cosmetic dentistry"]
            },
            "personas": {"roles": ["practice manager"]}
        }))
        .expect("valid intake")
    }

    struct FixedLlm(String);

    #[async_trait]
    impl LlmProvider for FixedLlm {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            Ok(GenerationResponse::from_text(self.0.clone()))
        }
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(
            normalize_query("Dental Clinic, in Austin TX!"),
            "dental clinic austin tx"
        );
        assert_eq!(
            normalize_query("a b c d e f g h i j"),
            "b c d e f g h i"
        );
        assert_eq!(normalize_query("austin austin dental"), "austin dental");
    }

    #[test]
    fn test_query_from_texts_skips_blank() {
        let queries = Query::from_texts(["first", "  ", "second "]);
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[1], Query::new(1, "second"));
    }

    #[test]
    fn test_entity_subtype_accepts_string_or_list() {
        let constraints = dental_constraints();
        assert_eq!(constraints.targets.entity_subtype, vec!["dental clinic"]);
        assert_eq!(constraints.targets.locations.len(), 2);
    }

    #[tokio::test]
    async fn test_keyword_planner_is_deterministic() {
        let planner = KeywordQueryPlanner::new();
        let constraints = dental_constraints();

        let first = planner.plan(&constraints).await.expect("plan");
        let second = planner.plan(&constraints).await.expect("plan");

        assert_eq!(first, second);
        assert!((MIN_PLANNED_QUERIES..=MAX_PLANNED_QUERIES).contains(&first.len()));
        assert_eq!(first[0].text, "dental clinic austin tx");
        for (i, query) in first.iter().enumerate() {
            assert_eq!(query.index, i);
            let words = query.text.split_whitespace().count();
            assert!((MIN_QUERY_WORDS..=MAX_QUERY_WORDS).contains(&words));
            assert_eq!(query.text, query.text.to_lowercase());
        }
    }

    #[tokio::test]
    async fn test_keyword_planner_rejects_empty_constraints() {
        let planner = KeywordQueryPlanner::new();
        let err = planner
            .plan(&IntakeConstraints::default())
            .await
            .expect_err("nothing to plan from");
        assert!(matches!(err, IntakeError::InvalidConstraints(_)));
    }

    #[tokio::test]
    async fn test_keyword_planner_rejects_too_few_queries() {
        let constraints: IntakeConstraints = serde_json::from_value(serde_json::json!({
            "targets": {"locations": ["austin"]}
        }))
        .expect("valid intake");

        let err = KeywordQueryPlanner::new()
            .plan(&constraints)
            .await
            .expect_err("one word cannot make three queries");
        assert!(err.to_string().contains("usable queries"));
    }

    #[tokio::test]
    async fn test_llm_planner_normalizes_response() {
        let llm = Arc::new(FixedLlm(
            "```json\n{\"queries\": [\"Dental Clinic Austin TX\", \"dental clinic austin tx\", \"cosmetic dentistry austin clinic\", \"practice manager dental clinic austin\"]}\n```"
                .to_string(),
        ));
        let planner = LlmQueryPlanner::new(llm, "test-model");

        let queries = planner.plan(&dental_constraints()).await.expect("plan");
        assert_eq!(queries.len(), 3);
        assert_eq!(queries[0].text, "dental clinic austin tx");
    }

    #[tokio::test]
    async fn test_llm_planner_rejects_non_json() {
        let planner = LlmQueryPlanner::new(Arc::new(FixedLlm("no idea".to_string())), "m");
        let err = planner
            .plan(&dental_constraints())
            .await
            .expect_err("unparseable plan");
        assert!(matches!(err, IntakeError::ResponseParse(_)));
    }
}
