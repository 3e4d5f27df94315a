//! JSON extraction from free-form LLM output.
//!
//! Research agents and the structuring collaborator are asked for JSON only,
//! but models still wrap answers in markdown fences or put prose around
//! them. Extraction tries, in order:
//! 1. Fenced `json` code blocks, then generic fenced blocks
//! 2. Content that already starts with '{' or '['
//! 3. The largest balanced JSON object anywhere in the text (later wins ties)
//! 4. The first balanced JSON array anywhere in the text
//!
//! # Example
//!
//! ```
//! use lead_forge::utils::json_extraction::parse_json_from_response;
//!
//! let value = parse_json_from_response("Result: {\"leads\": []}").unwrap();
//! assert!(value["leads"].is_array());
//! ```

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Error type for JSON extraction failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed_braces} unclosed braces, {unclosed_brackets} unclosed brackets. Partial: {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed_braces: usize,
        unclosed_brackets: usize,
    },
    #[error("No JSON content found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
}

/// Brace/bracket balance of a piece of text.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonStructureAnalysis {
    /// Number of '{' without a matching '}'.
    pub unclosed_braces: usize,
    /// Number of '[' without a matching ']'.
    pub unclosed_brackets: usize,
    /// Whether the text ended inside a string literal.
    pub in_string: bool,
    /// Byte offset of the first '{' or '['.
    pub json_start: Option<usize>,
}

impl JsonStructureAnalysis {
    fn is_truncated(&self) -> bool {
        self.json_start.is_some()
            && (self.unclosed_braces > 0 || self.unclosed_brackets > 0 || self.in_string)
    }
}

/// Scans `s` and tracks brace/bracket depth outside string literals.
pub fn analyze_json_structure(s: &str) -> JsonStructureAnalysis {
    let mut brace_depth: isize = 0;
    let mut bracket_depth: isize = 0;
    let mut in_string = false;
    let mut escape_next = false;
    let mut json_start: Option<usize> = None;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => {
                json_start.get_or_insert(i);
                brace_depth += 1;
            }
            '}' if !in_string => brace_depth -= 1,
            '[' if !in_string => {
                json_start.get_or_insert(i);
                bracket_depth += 1;
            }
            ']' if !in_string => bracket_depth -= 1,
            _ => {}
        }
    }

    JsonStructureAnalysis {
        unclosed_braces: brace_depth.max(0) as usize,
        unclosed_brackets: bracket_depth.max(0) as usize,
        in_string,
        json_start,
    }
}

/// Finds the index of the delimiter closing the one `s` starts with.
///
/// `s` must start with `open`. String literals and escapes are skipped.
pub fn find_matching_close(s: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

fn parse_balanced(s: &str) -> Option<Value> {
    let (open, close) = match s.chars().next()? {
        '{' => ('{', '}'),
        '[' => ('[', ']'),
        _ => return None,
    };
    let end = find_matching_close(s, open, close)?;
    serde_json::from_str(&s[..=end]).ok()
}

fn fenced_blocks(content: &str) -> Vec<&str> {
    let Ok(re) = Regex::new(r"```(?:json|JSON)?[ \t]*\n?([\s\S]*?)```") else {
        return Vec::new();
    };
    re.captures_iter(content)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim()))
        .collect()
}

/// Returns the largest valid JSON object in `content`, preferring later
/// occurrences when sizes tie.
pub fn extract_last_valid_json_object(content: &str) -> Option<Value> {
    content
        .char_indices()
        .filter(|(_, c)| *c == '{')
        .filter_map(|(start, _)| {
            let substr = &content[start..];
            let end = find_matching_close(substr, '{', '}')?;
            let candidate = &substr[..=end];
            serde_json::from_str::<Value>(candidate)
                .ok()
                .map(|v| (start, candidate.len(), v))
        })
        .max_by(|(pos_a, len_a, _), (pos_b, len_b, _)| len_a.cmp(len_b).then(pos_a.cmp(pos_b)))
        .map(|(_, _, v)| v)
}

/// Parses the JSON value embedded in an LLM response.
pub fn parse_json_from_response(content: &str) -> Result<Value, JsonExtractionError> {
    let trimmed = content.trim();

    for block in fenced_blocks(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            return Ok(value);
        }
        if let Some(value) = block
            .find(['{', '['])
            .and_then(|start| parse_balanced(&block[start..]))
        {
            return Ok(value);
        }
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    if let Some(value) = parse_balanced(trimmed) {
        return Ok(value);
    }

    if let Some(value) = extract_last_valid_json_object(trimmed) {
        return Ok(value);
    }

    if let Some(value) = trimmed
        .find('[')
        .and_then(|start| parse_balanced(&trimmed[start..]))
    {
        return Ok(value);
    }

    let analysis = analyze_json_structure(trimmed);
    if analysis.is_truncated() {
        let start = analysis.json_start.unwrap_or(0);
        let partial: String = trimmed[start..].chars().take(100).collect();
        return Err(JsonExtractionError::Truncated {
            partial_preview: partial,
            unclosed_braces: analysis.unclosed_braces,
            unclosed_brackets: analysis.unclosed_brackets,
        });
    }

    Err(JsonExtractionError::NotFound {
        content_preview: trimmed.chars().take(50).collect(),
    })
}
