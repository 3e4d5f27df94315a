//! The canonical lead record.

use serde::{Deserialize, Serialize};

/// Literal stored for every unknown field.
pub const UNKNOWN: &str = "unknown";

/// Canonical lead record with a fixed field set.
///
/// Records are built by the validation gate and never modified afterwards;
/// fields are read through accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadRecord {
    company: String,
    website: String,
    email: String,
    phone: String,
    location: String,
    description: String,
    source: String,
    source_urls: Vec<String>,
}

impl LeadRecord {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        company: String,
        website: String,
        email: String,
        phone: String,
        location: String,
        description: String,
        source: String,
        source_urls: Vec<String>,
    ) -> Self {
        Self {
            company,
            website,
            email,
            phone,
            location,
            description,
            source,
            source_urls,
        }
    }

    pub fn company(&self) -> &str {
        &self.company
    }

    pub fn website(&self) -> &str {
        &self.website
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn phone(&self) -> &str {
        &self.phone
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Label of the agent kind that found the lead.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Valid URLs the lead was found at. Empty when none are known.
    pub fn source_urls(&self) -> &[String] {
        &self.source_urls
    }

    /// Returns true if an email or phone number is known.
    pub fn has_contact(&self) -> bool {
        self.email != UNKNOWN || self.phone != UNKNOWN
    }

    /// Returns true if no identifying field is known.
    pub fn is_blank(&self) -> bool {
        [&self.company, &self.website, &self.email, &self.phone]
            .iter()
            .all(|v| v.as_str() == UNKNOWN)
    }
}
