//! Record model shared by the feed adapters, the sync pipeline and the document stores.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "conduit-core";

/// Untyped record exactly as a feed delivered it: a CSV row (all string values)
/// or one JSON item. Expected to be an object; anything else fails normalization.
pub type RawRecord = serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArticleSource {
    pub id: String,
    pub name: String,
}

/// Canonical news article. Absent source values are empty strings, never missing keys.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub description: String,
    pub content: String,
    pub url: String,
    pub url_to_image: String,
    pub published_at: String,
    pub published_date: String,
    pub author: String,
    pub source: ArticleSource,
}

/// Canonical phishing feed entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhishEntry {
    pub phish_id: String,
    pub url: String,
    pub phish_detail_url: String,
    pub submission_time: String,
    pub verified: bool,
    pub verification_time: String,
    pub online: bool,
    pub target: String,
}

/// Fixed-shape record produced by the normalizer. Unknown source fields are gone by now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanonicalRecord {
    Article(Article),
    Phish(PhishEntry),
}

impl CanonicalRecord {
    pub fn data_type(&self) -> &'static str {
        match self {
            CanonicalRecord::Article(_) => "news_article",
            CanonicalRecord::Phish(_) => "phish_entry",
        }
    }
}

/// Content-richness metrics computed by the enricher.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataQuality {
    /// Character count per text field.
    pub lengths: BTreeMap<String, usize>,
    /// `has_<field>` presence flags.
    pub flags: BTreeMap<String, bool>,
}

/// Ingestion metadata, kept under its own key so it never collides with source fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtlMetadata {
    pub ingestion_timestamp: DateTime<Utc>,
    pub ingestion_date: String,
    pub source: String,
    pub data_type: String,
    pub connector_version: String,
    pub data_quality: DataQuality,
    #[serde(default)]
    pub data_quality_issues: Vec<String>,
}

impl EtlMetadata {
    /// Every metadata field except the per-run ingestion time.
    fn stable_view(&self) -> (&str, &str, &str, &DataQuality, &[String]) {
        (
            &self.source,
            &self.data_type,
            &self.connector_version,
            &self.data_quality,
            &self.data_quality_issues,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub record: CanonicalRecord,
    pub etl_metadata: EtlMetadata,
}

impl EnrichedRecord {
    /// Equality with `ingestion_timestamp` and `ingestion_date` masked out.
    pub fn content_eq(&self, other: &EnrichedRecord) -> bool {
        self.record == other.record
            && self.etl_metadata.stable_view() == other.etl_metadata.stable_view()
    }
}

/// Deduplication key derived from record content. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NaturalKey(String);

impl NaturalKey {
    pub fn new(value: impl Into<String>) -> Result<Self, KeyError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NaturalKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NaturalKey> for String {
    fn from(key: NaturalKey) -> Self {
        key.0
    }
}

/// An enriched record as persisted, plus its storage-assigned identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub natural_key: NaturalKey,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub document: EnrichedRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("raw record is not an object (found {found})")]
    NotAnObject { found: &'static str },
    #[error("key field `{field}` is absent from the raw record")]
    MissingKeyField { field: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("natural key must not be empty")]
    Empty,
    #[error("{data_type} record has no value for key field `{field}`")]
    MissingField {
        data_type: &'static str,
        field: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn enriched(at: DateTime<Utc>) -> EnrichedRecord {
        EnrichedRecord {
            record: CanonicalRecord::Phish(PhishEntry {
                phish_id: "9001".into(),
                url: "http://login.example.test/".into(),
                online: true,
                ..Default::default()
            }),
            etl_metadata: EtlMetadata {
                ingestion_timestamp: at,
                ingestion_date: at.format("%Y-%m-%d").to_string(),
                source: "phishtank".into(),
                data_type: "phish_entry".into(),
                connector_version: "0.1.0".into(),
                data_quality: DataQuality::default(),
                data_quality_issues: vec!["missing_target".into()],
            },
        }
    }

    #[test]
    fn natural_key_rejects_blank_values() {
        assert_eq!(NaturalKey::new("   "), Err(KeyError::Empty));
        assert_eq!(NaturalKey::new(" 42 ").unwrap().as_str(), "42");
        let parsed: Result<NaturalKey, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn content_eq_ignores_ingestion_time_only() {
        let first = enriched(Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap());
        let second = enriched(Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).single().unwrap());
        assert!(first.content_eq(&second));

        let mut changed = second.clone();
        changed.etl_metadata.data_quality_issues.clear();
        assert!(!first.content_eq(&changed));

        let mut changed = second;
        if let CanonicalRecord::Phish(entry) = &mut changed.record {
            entry.online = false;
        }
        assert!(!first.content_eq(&changed));
    }

    #[test]
    fn metadata_is_namespaced_away_from_source_fields() {
        let doc = enriched(Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap());
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["record"]["kind"], "phish");
        assert_eq!(value["record"]["phish_id"], "9001");
        assert_eq!(value["etl_metadata"]["source"], "phishtank");
        assert_eq!(value["etl_metadata"]["ingestion_date"], "2026-03-01");

        let back: EnrichedRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }
}
