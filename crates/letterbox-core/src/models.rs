//! Core data models used throughout Letterbox.
//!
//! These types represent the documents, personas, and search results that
//! flow through indexing and retrieval. Documents carry free-form metadata;
//! the accessors below read the well-known keys (`source_id`, `subject`,
//! `sender`, `date`, `label`, `chunk_index`, `total_chunks`).

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form document metadata.
pub type Metadata = serde_json::Map<String, Value>;

/// A unit of retrievable text plus its metadata.
///
/// Chunking produces derived documents that carry `chunk_index`,
/// `total_chunks` and `source_id` pointing back at the parent item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    /// Builder-style metadata setter.
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(Value::as_u64)
    }

    pub fn source_id(&self) -> Option<&str> {
        self.meta_str("source_id")
            .or_else(|| self.meta_str("email_id"))
            .or_else(|| self.meta_str("id"))
    }

    pub fn subject(&self) -> Option<&str> {
        self.meta_str("subject").or_else(|| self.meta_str("title"))
    }

    pub fn sender(&self) -> Option<&str> {
        self.meta_str("sender")
    }

    pub fn label(&self) -> Option<&str> {
        self.meta_str("label")
    }

    /// Raw date string as stored in metadata.
    pub fn date_str(&self) -> Option<&str> {
        self.meta_str("date")
    }

    /// Parsed document date, if present and well-formed.
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.date_str().and_then(parse_date)
    }

    pub fn chunk_index(&self) -> Option<u64> {
        self.meta_u64("chunk_index")
    }

    pub fn total_chunks(&self) -> Option<u64> {
        self.meta_u64("total_chunks")
    }
}

/// Parse the date formats found in email metadata.
///
/// Accepts RFC 3339, RFC 2822 (mail headers), naive ISO-8601 date-times
/// (treated as UTC) and bare `YYYY-MM-DD` dates.
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Post-retrieval filters. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Exact match on the document's `label`.
    pub label: Option<String>,
    /// Only documents dated within this many days of `now`.
    /// Documents without a parseable date are excluded. A window reaching
    /// past the earliest representable date admits every dated document.
    pub max_age_days: Option<u32>,
    /// Case-insensitive substring match on the document's `sender`.
    pub sender: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.label.is_none() && self.max_age_days.is_none() && self.sender.is_none()
    }

    pub fn matches(&self, doc: &Document, now: DateTime<Utc>) -> bool {
        if let Some(label) = &self.label {
            if doc.label() != Some(label.as_str()) {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            let wanted = sender.to_lowercase();
            match doc.sender() {
                Some(s) if s.to_lowercase().contains(&wanted) => {}
                _ => return false,
            }
        }
        if let Some(days) = self.max_age_days {
            let cutoff = Duration::try_days(i64::from(days)).and_then(|d| now.checked_sub_signed(d));
            match (doc.date(), cutoff) {
                (Some(date), Some(cutoff)) if date >= cutoff => {}
                (Some(_), None) => {}
                _ => return false,
            }
        }
        true
    }
}

/// A retrieved document paired with its raw relevance score.
///
/// Vector search scores are inner products (not normalized); text search
/// scores are summed term-occurrence counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f32,
}

/// A recurring sender's profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub sender: String,
    pub first_name: String,
    pub email_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub topics: BTreeSet<String>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
}

/// Availability and health of a single provider, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub available: bool,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_date_formats() {
        assert!(parse_date("2025-03-01T08:30:00Z").is_some());
        assert!(parse_date("2025-03-01T08:30:00.123456").is_some());
        assert!(parse_date("Sat, 01 Mar 2025 08:30:00 +0000").is_some());
        assert_eq!(
            parse_date("2025-03-01"),
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap())
        );
        assert!(parse_date("last tuesday").is_none());
    }

    #[test]
    fn test_accessors_ignore_blank_values() {
        let doc = Document::new("body")
            .with_meta("subject", "  ")
            .with_meta("title", "Weekly digest")
            .with_meta("email_id", "e-42");
        assert_eq!(doc.subject(), Some("Weekly digest"));
        assert_eq!(doc.source_id(), Some("e-42"));
        assert_eq!(doc.sender(), None);
    }

    #[test]
    fn test_filter_label_and_sender() {
        let doc = Document::new("x")
            .with_meta("label", "news")
            .with_meta("sender", "Nate <nate@example.com>");
        let mut f = SearchFilters {
            label: Some("news".into()),
            sender: Some("NATE@".into()),
            ..Default::default()
        };
        assert!(f.matches(&doc, now()));
        f.label = Some("sports".into());
        assert!(!f.matches(&doc, now()));
    }

    #[test]
    fn test_filter_max_age_excludes_undated() {
        let f = SearchFilters {
            max_age_days: Some(7),
            ..Default::default()
        };
        let recent = Document::new("x").with_meta("date", "2025-03-08T00:00:00Z");
        let old = Document::new("x").with_meta("date", "2025-02-01T00:00:00Z");
        let undated = Document::new("x");
        let garbage = Document::new("x").with_meta("date", "soon");
        assert!(f.matches(&recent, now()));
        assert!(!f.matches(&old, now()));
        assert!(!f.matches(&undated, now()));
        assert!(!f.matches(&garbage, now()));
    }

    #[test]
    fn test_filter_max_age_beyond_calendar_admits_dated() {
        let f = SearchFilters {
            max_age_days: Some(u32::MAX),
            ..Default::default()
        };
        let ancient = Document::new("x").with_meta("date", "1970-01-01");
        assert!(f.matches(&ancient, now()));
        assert!(f.matches(&ancient, DateTime::<Utc>::MIN_UTC));
        assert!(!f.matches(&Document::new("x"), now()));
    }

    #[test]
    fn test_document_serde_defaults_metadata() {
        let doc: Document = serde_json::from_str(r#"{"content":"hi"}"#).unwrap();
        assert!(doc.metadata.is_empty());
    }
}
