use chrono::{DateTime, Utc};
use conduit_core::{CanonicalRecord, DataQuality, EnrichedRecord, EtlMetadata};

pub const CONNECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Text metrics and presence flags for one record, in declaration order.
struct QualityProfile {
    lengths: Vec<(&'static str, usize)>,
    flags: Vec<(&'static str, bool)>,
}

fn char_len(value: &str) -> usize {
    value.chars().count()
}

fn quality_profile(record: &CanonicalRecord) -> QualityProfile {
    match record {
        CanonicalRecord::Article(a) => QualityProfile {
            lengths: vec![
                ("title", char_len(&a.title)),
                ("description", char_len(&a.description)),
                ("content", char_len(&a.content)),
            ],
            flags: vec![
                ("title", !a.title.is_empty()),
                ("description", !a.description.is_empty()),
                ("content", !a.content.is_empty()),
                ("url", !a.url.is_empty()),
                ("image", !a.url_to_image.is_empty()),
                ("author", !a.author.is_empty()),
                ("published_at", !a.published_at.is_empty()),
            ],
        },
        CanonicalRecord::Phish(p) => QualityProfile {
            lengths: vec![("url", char_len(&p.url)), ("target", char_len(&p.target))],
            flags: vec![
                ("url", !p.url.is_empty()),
                ("target", !p.target.is_empty()),
                ("detail_url", !p.phish_detail_url.is_empty()),
                ("submission_time", !p.submission_time.is_empty()),
                ("verification_time", !p.verification_time.is_empty()),
            ],
        },
    }
}

/// Attach ingestion metadata and data-quality indicators. Pure in its inputs.
pub fn enrich(record: CanonicalRecord, now: DateTime<Utc>, source_id: &str) -> EnrichedRecord {
    let profile = quality_profile(&record);

    let data_quality_issues = profile
        .flags
        .iter()
        .filter(|(_, present)| !present)
        .map(|(name, _)| format!("missing_{name}"))
        .collect();
    let data_quality = DataQuality {
        lengths: profile
            .lengths
            .into_iter()
            .map(|(name, len)| (name.to_string(), len))
            .collect(),
        flags: profile
            .flags
            .into_iter()
            .map(|(name, present)| (format!("has_{name}"), present))
            .collect(),
    };

    EnrichedRecord {
        etl_metadata: EtlMetadata {
            ingestion_timestamp: now,
            ingestion_date: now.format("%Y-%m-%d").to_string(),
            source: source_id.to_string(),
            data_type: record.data_type().to_string(),
            connector_version: CONNECTOR_VERSION.to_string(),
            data_quality,
            data_quality_issues,
        },
        record,
    }
}
