//! Structuring/validation gate.
//!
//! Every successful stage result passes through the gate before it can be
//! persisted. The gate asks the [`Structurer`] for JSON objects, maps them
//! onto [`LeadRecord`]s and retries malformed payloads a bounded number of
//! times. The cap comes from the task's [`Attempt`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use super::format::{clean_text, normalize_email, normalize_phone, normalize_url};
use super::lead::{LeadRecord, UNKNOWN};
use crate::agents::{AgentKind, RawPayload, Structurer};
use crate::error::ErrorKind;
use crate::stage::{Attempt, StageError, StageOutcome, StageResult};

const COMPANY_KEYS: &[&str] = &[
    "company",
    "company_name",
    "name",
    "business_name",
    "organization",
    "title",
];
const WEBSITE_KEYS: &[&str] = &[
    "website",
    "website_url",
    "site",
    "url",
    "homepage",
    "linkedin_url",
    "facebook_url",
];
const EMAIL_KEYS: &[&str] = &["email", "mail", "email_address", "e-mail"];
const PHONE_KEYS: &[&str] = &["phone", "phone_number", "telephone", "tel", "mobile"];
const LOCATION_KEYS: &[&str] = &[
    "location",
    "address",
    "physical_address",
    "headquarters_location",
    "city",
];
const DESCRIPTION_KEYS: &[&str] = &["description", "summary", "snippet", "about"];
const SOURCE_URL_KEYS: &[&str] = &["source_urls", "sources", "links"];

/// Decision for one structuring attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The payload produced these records (possibly none).
    Accepted(Vec<LeadRecord>),
    /// The attempt failed; retry with this feedback.
    RetryWith(String),
    /// The attempt failed and no attempt is left.
    Invalid(String),
}

/// Records accepted by the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    pub records: Vec<LeadRecord>,
    /// Structuring attempts spent.
    pub attempts: u32,
}

/// A stage result the gate could not turn into records.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub error: StageError,
    /// Structuring attempts spent (zero if the stage itself failed).
    pub attempts: u32,
}

/// The structuring/validation gate.
pub struct ValidationGate {
    structurer: Arc<dyn Structurer>,
    retry_delay: Duration,
}

impl std::fmt::Debug for ValidationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationGate")
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl ValidationGate {
    /// Creates a gate with a constant delay between structuring attempts.
    pub fn new(structurer: Arc<dyn Structurer>, retry_delay: Duration) -> Self {
        Self {
            structurer,
            retry_delay,
        }
    }

    /// Runs one structuring attempt.
    pub async fn judge(
        &self,
        agent: AgentKind,
        payload: &RawPayload,
        attempt: &Attempt,
        feedback: Option<&str>,
    ) -> Verdict {
        match self.structurer.structure(payload, attempt, feedback).await {
            Ok(items) => Verdict::Accepted(
                items
                    .iter()
                    .filter_map(|item| canonicalize(agent, item))
                    .collect(),
            ),
            Err(e) if attempt.is_last() => Verdict::Invalid(e.to_string()),
            Err(e) => Verdict::RetryWith(format!(
                "attempt {} failed ({}). Return only a JSON object of the form {{\"leads\": [...]}}",
                attempt, e
            )),
        }
    }

    /// Validates a stage result.
    ///
    /// Failed stage results pass through unchanged. Payloads are structured
    /// until accepted or until the task's attempts run out, which yields an
    /// `invalid` error.
    pub async fn validate(&self, result: &StageResult) -> Result<Validated, Rejected> {
        let payload = match &result.outcome {
            StageOutcome::Payload(payload) => payload,
            StageOutcome::Failed(error) => {
                return Err(Rejected {
                    error: error.clone(),
                    attempts: 0,
                })
            }
        };

        let task = &result.task;
        let mut attempt = task.attempt;
        let mut feedback: Option<String> = None;

        loop {
            match self
                .judge(task.agent, payload, &attempt, feedback.as_deref())
                .await
            {
                Verdict::Accepted(records) => {
                    return Ok(Validated {
                        records,
                        attempts: attempt.number(),
                    })
                }
                Verdict::Invalid(message) => {
                    tracing::warn!(
                        task_id = %task.id,
                        agent = %task.agent,
                        attempts = attempt.number(),
                        error = %message,
                        "Structuring exhausted retries"
                    );
                    return Err(Rejected {
                        error: StageError::new(ErrorKind::Invalid, message),
                        attempts: attempt.number(),
                    });
                }
                Verdict::RetryWith(prompt) => {
                    let Some(next) = attempt.next() else {
                        return Err(Rejected {
                            error: StageError::new(ErrorKind::Invalid, prompt),
                            attempts: attempt.number(),
                        });
                    };
                    tracing::debug!(
                        task_id = %task.id,
                        agent = %task.agent,
                        attempt = %attempt,
                        "Structuring attempt rejected, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt = next;
                    feedback = Some(prompt);
                }
            }
        }
    }
}

/// Looks up the first alias present in `item` (keys compared
/// case-insensitively) whose value survives `check`.
fn lookup<F>(item: &Map<String, Value>, aliases: &[&str], check: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    aliases.iter().find_map(|alias| {
        item.iter()
            .filter(|(key, _)| key.trim().eq_ignore_ascii_case(alias))
            .find_map(|(_, value)| scalar_text(value).and_then(|text| check(&text)))
    })
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => items.iter().find_map(scalar_text),
        _ => None,
    }
}

fn source_urls(item: &Map<String, Value>) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for alias in SOURCE_URL_KEYS {
        for (_, value) in item
            .iter()
            .filter(|(key, _)| key.trim().eq_ignore_ascii_case(alias))
        {
            let candidates: Vec<&str> = match value {
                Value::String(s) => s.split([',', ' ', '\n']).collect(),
                Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                _ => Vec::new(),
            };
            for url in candidates.into_iter().filter_map(normalize_url) {
                if !urls.contains(&url) {
                    urls.push(url);
                }
            }
        }
    }
    urls
}

/// Maps one structured item onto a lead record.
///
/// Pure: the same item always yields the same record. Items without a
/// company, website, email or phone carry no lead and yield `None`.
pub fn canonicalize(agent: AgentKind, item: &Map<String, Value>) -> Option<LeadRecord> {
    let or_unknown = |v: Option<String>| v.unwrap_or_else(|| UNKNOWN.to_string());

    let record = LeadRecord::new(
        or_unknown(lookup(item, COMPANY_KEYS, clean_text)),
        or_unknown(lookup(item, WEBSITE_KEYS, normalize_url)),
        or_unknown(lookup(item, EMAIL_KEYS, normalize_email)),
        or_unknown(lookup(item, PHONE_KEYS, normalize_phone)),
        or_unknown(lookup(item, LOCATION_KEYS, clean_text)),
        or_unknown(lookup(item, DESCRIPTION_KEYS, clean_text)),
        agent.as_str().to_string(),
        source_urls(item),
    );

    (!record.is_blank()).then_some(record)
}
