//! Prompt text for the LLM-backed research agents and structurer.

use super::types::AgentKind;

/// System prompt for the LinkedIn research agent.
pub const LINKEDIN_RESEARCH_PROMPT: &str = r#"You research organization-level LinkedIn pages for the given search query.
Priority: emails and phone numbers are highest priority. Extract explicit contact fields whenever present.

TASK:
- Look for up to 3 distinct organization-level LinkedIn pages matching the query ("<query> LinkedIn", "<query> official LinkedIn").
- Prefer pages that show an email or phone number.

EXTRACTION:
- Return ONLY explicitly visible fields, never infer:
  company_name, linkedin_url, headquarters_location, email, phone_number, description, industry, source_urls
- Also return flags: has_email (true/false), has_phone (true/false).
- If a field is missing, return "unknown".
- If nothing is found, return {"results": [], "message": "No LinkedIn pages found"}.

OUTPUT: JSON only
{"results":[{...}]}"#;

/// System prompt for the Facebook research agent.
pub const FACEBOOK_RESEARCH_PROMPT: &str = r#"You research Facebook business pages for the given search query.
Priority: emails and phone numbers are highest priority. Extract explicit contact fields whenever present.

TASK:
- Look for up to 3 valid Facebook business pages matching the query ("<query> Facebook page", "<query> official Facebook").
- Prefer pages that show an email or phone number.

EXTRACTION:
- Return ONLY explicitly visible fields:
  business_name, facebook_url, email, phone_number, physical_address, description, source_urls
- Flags: has_email, has_phone
- Missing -> "unknown"
- If nothing is found, return {"results": [], "message": "No Facebook pages found"}.

OUTPUT: JSON only
{"results":[{...}]}"#;

/// System prompt for the company website research agent.
pub const WEBSITE_RESEARCH_PROMPT: &str = r#"You research official company websites for the given search query.
Priority: emails and phone numbers are highest priority. Extract explicit contact fields whenever present.

TASK:
- Look for up to 3 distinct official sites matching the query ("<query> official website", "<query> contact").
- Prefer contact and about pages.

EXTRACTION:
- Return ONLY explicitly visible fields:
  company_name, website_url, email, phone_number, physical_address, description, services_offered, year_established, source_urls
- Flags: has_email, has_phone, has_website
- Missing -> "unknown"
- If nothing is found, return {"results": [], "message": "No official website found"}.

OUTPUT: JSON only
{"results":[{...}]}"#;

/// System prompt for the map listing research agent.
pub const GMAP_RESEARCH_PROMPT: &str = r#"You research map listings (business directories with addresses) for the given search query.
Priority: emails and phone numbers are highest priority. Extract explicit contact fields whenever present.

TASK:
- Treat the query as "<business type> <location>" and list matching businesses.

EXTRACTION:
- Return raw-normalized fields:
  business_name, address, phone_number, website, rating, reviews_count, business_type, has_phone, has_website, source_urls
- Missing -> "unknown"
- On failure, return {"results": [], "error": "<error message>"}.

OUTPUT: JSON only
{"results":[{...}]}"#;

/// System prompt for the structuring collaborator.
pub const STRUCTURING_PROMPT: &str = r#"Normalize raw lead data into LeadList JSON.

Rules:
- Extract every distinct COMPANY explicitly present.
- Ignore ads, UI labels, navigation text, or generic directories.
- Extract email and phone aggressively, but ONLY if explicitly shown.
- Never guess or infer values.
- Missing values -> "unknown".
- If no website exists, LinkedIn URL may be used as website.
- Collect all referenced links in source_urls.
- One object per company.

Output:
Return ONLY valid JSON matching exactly:
{"leads":[{"company":"","website":"","mail":"","phone_number":"","location":"","description":"","source_urls":[]}]}"#;

/// Returns the research system prompt for an agent kind.
pub fn research_prompt(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::Linkedin => LINKEDIN_RESEARCH_PROMPT,
        AgentKind::Facebook => FACEBOOK_RESEARCH_PROMPT,
        AgentKind::Website => WEBSITE_RESEARCH_PROMPT,
        AgentKind::Gmap => GMAP_RESEARCH_PROMPT,
    }
}

/// Builds the user message for a structuring attempt.
pub fn structuring_user_prompt(raw: &str, feedback: Option<&str>) -> String {
    match feedback {
        Some(feedback) => format!(
            "Raw lead data:\n{}\n\nYour previous answer was rejected: {}\nReturn ONLY the JSON object.",
            raw, feedback
        ),
        None => format!("Raw lead data:\n{}", raw),
    }
}
