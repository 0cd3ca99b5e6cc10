//! PhishTank-style CSV feed.
//!
//! | canonical field     | CSV column          | coercion                  |
//! |---------------------|---------------------|---------------------------|
//! | `phish_id`          | `phish_id`          | text, key field           |
//! | `url`               | `url`               | text                      |
//! | `phish_detail_url`  | `phish_detail_url`  | text                      |
//! | `submission_time`   | `submission_time`   | timestamp                 |
//! | `verified`          | `verified`          | flag                      |
//! | `verification_time` | `verification_time` | timestamp                 |
//! | `online`            | `online`            | flag                      |
//! | `target`            | `target`            | text                      |

use conduit_core::{CanonicalRecord, NormalizationError, PhishEntry, RawRecord};
use conduit_storage::FetchRequest;
use serde_json::{Map, Value};

use crate::fields::{flag, text, timestamp, type_name};
use crate::{AdapterError, FeedAdapter, FeedKind, SourceSettings};

pub const KEY_FIELD: &str = "phish_id";

#[derive(Debug, Clone, Copy, Default)]
pub struct PhishTankCsvAdapter;

impl FeedAdapter for PhishTankCsvAdapter {
    fn kind(&self) -> FeedKind {
        FeedKind::PhishtankCsv
    }

    fn data_type(&self) -> &'static str {
        "phish_entry"
    }

    fn payload_extension(&self) -> &'static str {
        "csv"
    }

    fn fetch_request(&self, settings: &SourceSettings) -> Result<FetchRequest, AdapterError> {
        let mut request = FetchRequest::get(settings.url.clone());
        for (name, value) in &settings.query {
            request = request.with_query(name.clone(), value.clone());
        }
        Ok(request.with_header("Accept", "text/csv"))
    }

    fn parse_payload(&self, bytes: &[u8]) -> Result<Vec<RawRecord>, AdapterError> {
        let text = std::str::from_utf8(bytes)?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect::<Vec<_>>();
        if headers.iter().all(String::is_empty) {
            return Err(AdapterError::Shape("csv payload has no header row".to_string()));
        }

        let mut out = Vec::new();
        for row in reader.records() {
            let row = row?;
            let mut obj = Map::new();
            for (idx, header) in headers.iter().enumerate() {
                if header.is_empty() {
                    continue;
                }
                if let Some(cell) = row.get(idx) {
                    obj.insert(header.clone(), Value::String(cell.to_string()));
                }
            }
            out.push(Value::Object(obj));
        }
        Ok(out)
    }

    fn normalize(&self, raw: &RawRecord) -> Result<CanonicalRecord, NormalizationError> {
        let obj = raw.as_object().ok_or(NormalizationError::NotAnObject {
            found: type_name(raw),
        })?;
        if !obj.contains_key(KEY_FIELD) {
            return Err(NormalizationError::MissingKeyField { field: KEY_FIELD });
        }

        let (submission_time, _) = timestamp(obj, "submission_time");
        let (verification_time, _) = timestamp(obj, "verification_time");

        Ok(CanonicalRecord::Phish(PhishEntry {
            phish_id: text(obj, KEY_FIELD),
            url: text(obj, "url"),
            phish_detail_url: text(obj, "phish_detail_url"),
            submission_time,
            verified: flag(obj, "verified"),
            verification_time,
            online: flag(obj, "online"),
            target: text(obj, "target"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HEADER: &str =
        "phish_id,url,phish_detail_url,submission_time,verified,verification_time,online,target\n";

    fn phish(record: CanonicalRecord) -> PhishEntry {
        match record {
            CanonicalRecord::Phish(entry) => entry,
            other => panic!("expected phish entry, got {other:?}"),
        }
    }

    #[test]
    fn parses_header_keyed_rows_and_tolerates_short_rows() {
        let payload = format!("\u{feff}{HEADER}1,http://a.test/,,2026-01-01T00:00:00+00:00,yes,,yes,Bank\n2,http://b.test/\n");
        let rows = PhishTankCsvAdapter.parse_payload(payload.as_bytes()).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["phish_id"], "1");
        assert_eq!(rows[0]["target"], "Bank");
        assert_eq!(rows[1]["url"], "http://b.test/");
        assert!(rows[1].get("target").is_none());
    }

    #[test]
    fn rejects_payloads_that_are_not_csv_text() {
        assert!(matches!(
            PhishTankCsvAdapter.parse_payload(&[0xff, 0xfe, 0x00]),
            Err(AdapterError::Utf8(_))
        ));
        assert!(matches!(
            PhishTankCsvAdapter.parse_payload(b""),
            Err(AdapterError::Shape(_))
        ));
    }

    #[test]
    fn normalize_fills_sentinels_for_missing_columns() {
        let entry = phish(
            PhishTankCsvAdapter
                .normalize(&json!({"phish_id": " 77 ", "url": "http://x.test/", "extra": "dropped"}))
                .unwrap(),
        );
        assert_eq!(entry.phish_id, "77");
        assert_eq!(entry.url, "http://x.test/");
        assert_eq!(entry.phish_detail_url, "");
        assert_eq!(entry.submission_time, "");
        assert!(!entry.verified);
        assert!(!entry.online);
        assert_eq!(entry.target, "");
    }

    #[test]
    fn blank_key_value_still_normalizes() {
        let entry = phish(
            PhishTankCsvAdapter
                .normalize(&json!({"phish_id": "", "url": "http://no-id.test/"}))
                .unwrap(),
        );
        assert_eq!(entry.phish_id, "");
    }

    #[test]
    fn absent_key_column_or_non_object_fails() {
        assert_eq!(
            PhishTankCsvAdapter.normalize(&json!({"url": "http://x.test/"})),
            Err(NormalizationError::MissingKeyField { field: "phish_id" })
        );
        assert_eq!(
            PhishTankCsvAdapter.normalize(&json!(["1", "http://x.test/"])),
            Err(NormalizationError::NotAnObject { found: "array" })
        );
    }

    #[test]
    fn request_carries_configured_query() {
        let mut settings = SourceSettings {
            url: "https://data.phishtank.test/online-valid.csv".into(),
            ..Default::default()
        };
        settings.query.insert("format".into(), "csv".into());
        let request = PhishTankCsvAdapter.fetch_request(&settings).unwrap();
        assert_eq!(request.url, settings.url);
        assert_eq!(request.query, vec![("format".to_string(), "csv".to_string())]);
    }
}
