//! Feed adapter contracts: building the fetch request, parsing the payload into raw
//! records, and normalizing each raw record into its canonical shape.

use std::collections::BTreeMap;

use conduit_core::{CanonicalRecord, NormalizationError, RawRecord};
use conduit_storage::FetchRequest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod fields;
mod newsapi;
mod phishtank;

pub use newsapi::NewsApiAdapter;
pub use phishtank::PhishTankCsvAdapter;

pub const CRATE_NAME: &str = "conduit-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    PhishtankCsv,
    Newsapi,
}

impl FeedKind {
    /// The name used in `sources.yaml`.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::PhishtankCsv => "phishtank_csv",
            FeedKind::Newsapi => "newsapi",
        }
    }
}

/// Per-source settings an adapter needs to build its request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSettings {
    pub url: String,
    pub query: BTreeMap<String, String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("malformed csv payload: {0}")]
    Csv(#[from] csv::Error),
    #[error("malformed json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected payload shape: {0}")]
    Shape(String),
    #[error("feed reported status `{status}` ({code}): {message}")]
    FeedStatus {
        status: String,
        code: String,
        message: String,
    },
    #[error("source requires an api key but none was configured")]
    MissingApiKey,
}

impl AdapterError {
    /// Errors that mean the feed refused to serve data, as opposed to serving garbage.
    pub fn is_feed_failure(&self) -> bool {
        matches!(self, AdapterError::FeedStatus { .. } | AdapterError::MissingApiKey)
    }
}

pub trait FeedAdapter: Send + Sync {
    fn kind(&self) -> FeedKind;

    /// Value written to `etl_metadata.data_type`.
    fn data_type(&self) -> &'static str;

    /// File extension used when archiving raw payloads.
    fn payload_extension(&self) -> &'static str;

    fn fetch_request(&self, settings: &SourceSettings) -> Result<FetchRequest, AdapterError>;

    /// Split a whole payload into raw records. Any error here is fatal for the run.
    fn parse_payload(&self, bytes: &[u8]) -> Result<Vec<RawRecord>, AdapterError>;

    /// Map one raw record to the canonical shape. Never fails because of an ordinary missing field.
    fn normalize(&self, raw: &RawRecord) -> Result<CanonicalRecord, NormalizationError>;
}

pub fn adapter_for_kind(kind: FeedKind) -> Box<dyn FeedAdapter> {
    match kind {
        FeedKind::PhishtankCsv => Box::new(PhishTankCsvAdapter),
        FeedKind::Newsapi => Box::new(NewsApiAdapter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_kinds_use_snake_case_names() {
        let kind: FeedKind = serde_json::from_str("\"phishtank_csv\"").unwrap();
        assert_eq!(kind, FeedKind::PhishtankCsv);
        for kind in [FeedKind::PhishtankCsv, FeedKind::Newsapi] {
            assert_eq!(serde_json::to_string(&kind).unwrap(), format!("\"{}\"", kind.as_str()));
        }
        assert_eq!(format!("[{:<14}]", FeedKind::Newsapi.as_str()), "[newsapi       ]");
        assert_eq!(serde_json::to_string(&FeedKind::Newsapi).unwrap(), "\"newsapi\"");
    }

    #[test]
    fn registry_returns_matching_adapter() {
        assert_eq!(adapter_for_kind(FeedKind::Newsapi).kind(), FeedKind::Newsapi);
        assert_eq!(adapter_for_kind(FeedKind::PhishtankCsv).data_type(), "phish_entry");
    }

    #[test]
    fn feed_failures_are_distinguished_from_malformed_payloads() {
        let refused = AdapterError::FeedStatus {
            status: "error".into(),
            code: "apiKeyInvalid".into(),
            message: "Your API key is invalid".into(),
        };
        assert!(refused.is_feed_failure());
        assert!(!AdapterError::Shape("x".into()).is_feed_failure());
    }
}
