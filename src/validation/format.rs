//! Field format checks for lead records.
//!
//! Each check returns the cleaned value, or `None` when the value must be
//! replaced by `"unknown"`.

use std::sync::OnceLock;

use regex::Regex;
use reqwest::Url;

/// Minimum number of digits in a phone number.
pub const MIN_PHONE_DIGITS: usize = 7;

/// Values LLMs and scrapers use to say "nothing here".
const PLACEHOLDERS: &[&str] = &["", "unknown", "n/a", "na", "none", "null", "-", "not available"];

static EMAIL_RE: OnceLock<Option<Regex>> = OnceLock::new();
static DOMAIN_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn email_re() -> Option<&'static Regex> {
    EMAIL_RE
        .get_or_init(|| {
            Regex::new(
                r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,}$",
            )
            .ok()
        })
        .as_ref()
}

fn domain_re() -> Option<&'static Regex> {
    DOMAIN_RE
        .get_or_init(|| Regex::new(r"^(?:[a-z0-9](?:[a-z0-9\-]{0,61}[a-z0-9])?\.)+[a-z]{2,}$").ok())
        .as_ref()
}

/// Returns true for empty strings and "unknown"-style placeholders.
pub fn is_placeholder(value: &str) -> bool {
    let lowered = value.trim().to_lowercase();
    PLACEHOLDERS.contains(&lowered.as_str())
}

/// Trims `value` and rejects placeholders.
pub fn clean_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!is_placeholder(trimmed)).then(|| trimmed.to_string())
}

/// Validates an email address. A `mailto:` prefix is stripped.
pub fn normalize_email(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let address = trimmed
        .strip_prefix("mailto:")
        .unwrap_or(trimmed)
        .trim();
    let re = email_re()?;
    (re.is_match(address) && !address.contains("..")).then(|| address.to_string())
}

/// Validates a phone number: digits and `+ - . ( ) /` or spaces, with at
/// least seven digits. A `tel:` prefix is stripped.
pub fn normalize_phone(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let number = trimmed.strip_prefix("tel:").unwrap_or(trimmed).trim();

    let allowed = number
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | '(' | ')' | '/' | ' '));
    let digits = number.chars().filter(char::is_ascii_digit).count();

    (allowed && digits >= MIN_PHONE_DIGITS).then(|| number.to_string())
}

/// Validates a URL with a dotted host. URLs without a scheme are checked as
/// `https://` but returned as given; a trailing `/` is trimmed.
pub fn normalize_url(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return None;
    }

    let has_scheme = trimmed.contains("://");
    let candidate = if has_scheme {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let url = Url::parse(&candidate).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let host = url.host_str()?.to_lowercase();
    let host = host.strip_suffix('.').unwrap_or(&host);
    if !domain_re()?.is_match(host) {
        return None;
    }

    Some(trimmed.trim_end_matches('/').to_string())
}
