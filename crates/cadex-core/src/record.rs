//! Shared record types: reference entries and scraped cadastral results.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Status shown for records whose status was never resolved.
///
/// Also substituted by enrichment when the detail lookup fails.
pub const UNKNOWN_STATUS: &str = "Неизвестный";

/// A selectable `(code, label)` option: subject, region, settlement,
/// settlement type or street type.
///
/// Identity is `code`; `label` is display-only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    pub code: String,
    pub label: String,
}

impl Entry {
    pub fn new(code: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            label: label.into(),
        }
    }

    /// Serialised `code:label` form used as cache content.
    pub fn to_content(&self) -> String {
        format!("{}:{}", self.code, self.label)
    }

    /// Parse `code:label` cache content. The label may itself contain colons.
    pub fn from_content(content: &str) -> Option<Self> {
        let (code, label) = content.split_once(':')?;
        if code.is_empty() {
            return None;
        }
        Some(Self::new(code, label))
    }
}

/// One cadastral entry scraped from a results page.
///
/// Records are produced by page parsing and replaced (never mutated in place)
/// by enrichment. Identity is the cadastral number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub cad_number: String,
    pub address: String,
    /// Portal-relative detail page; only used by HTML-mode enrichment.
    #[serde(skip)]
    pub portal_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended: Option<BTreeMap<String, String>>,
    /// Secondary (public cadastral map) link found on the detail page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_address: Option<String>,
    /// Seconds since the query started when this record was merged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<f64>,
}

impl ResultRecord {
    pub fn new(
        cad_number: impl Into<String>,
        address: impl Into<String>,
        portal_address: Option<String>,
    ) -> Self {
        Self {
            cad_number: cad_number.into(),
            address: address.into(),
            portal_address,
            status: None,
            extended: None,
            secondary_address: None,
            elapsed_secs: None,
        }
    }

    pub fn status_or_unknown(&self) -> &str {
        self.status.as_deref().unwrap_or(UNKNOWN_STATUS)
    }

    /// Formatted line that filter and sort expressions run against.
    ///
    /// `"<cadnum>\t# <status>\t# <address>"`
    pub fn display_line(&self) -> String {
        format!(
            "{}\t# {}\t# {}",
            self.cad_number,
            self.status_or_unknown(),
            self.address
        )
    }

    pub fn with_status(self, status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            ..self
        }
    }

    pub fn with_unknown_status(self) -> Self {
        self.with_status(UNKNOWN_STATUS)
    }

    pub fn with_elapsed(self, elapsed: Duration) -> Self {
        Self {
            elapsed_secs: Some(elapsed.as_secs_f64()),
            ..self
        }
    }
}
