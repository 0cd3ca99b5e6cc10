//! Collection health report over stored documents.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use conduit_core::{CanonicalRecord, StoredDocument};
use conduit_storage::{DocumentStore, StoreError};
use serde::Serialize;

const TOP_ORIGINS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OriginCount {
    pub origin: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub collection: String,
    pub total_records: usize,
    pub today_records: usize,
    pub records_with_issues: usize,
    pub records_with_images: usize,
    pub unique_origins: usize,
    pub top_origins: Vec<OriginCount>,
    pub average_lengths: BTreeMap<String, f64>,
}

/// Article outlet name or phishing target; empty when the feed did not say.
fn origin(document: &StoredDocument) -> &str {
    match &document.document.record {
        CanonicalRecord::Article(article) => &article.source.name,
        CanonicalRecord::Phish(entry) => &entry.target,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn validation_report(collection: &str, documents: &[StoredDocument], today: NaiveDate) -> ValidationReport {
    let today = today.format("%Y-%m-%d").to_string();
    let mut origins: BTreeMap<&str, usize> = BTreeMap::new();
    let mut length_totals: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    let mut report = ValidationReport {
        collection: collection.to_string(),
        total_records: documents.len(),
        today_records: 0,
        records_with_issues: 0,
        records_with_images: 0,
        unique_origins: 0,
        top_origins: Vec::new(),
        average_lengths: BTreeMap::new(),
    };

    for document in documents {
        let meta = &document.document.etl_metadata;
        if meta.ingestion_date == today {
            report.today_records += 1;
        }
        if !meta.data_quality_issues.is_empty() {
            report.records_with_issues += 1;
        }
        if meta.data_quality.flags.get("has_image").copied().unwrap_or(false) {
            report.records_with_images += 1;
        }
        let name = origin(document);
        if !name.is_empty() {
            *origins.entry(name).or_default() += 1;
        }
        for (field, len) in &meta.data_quality.lengths {
            let slot = length_totals.entry(field.as_str()).or_default();
            slot.0 += len;
            slot.1 += 1;
        }
    }

    report.unique_origins = origins.len();
    let mut ranked: Vec<_> = origins.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    report.top_origins = ranked
        .into_iter()
        .take(TOP_ORIGINS)
        .map(|(origin, count)| OriginCount {
            origin: origin.to_string(),
            count,
        })
        .collect();
    report.average_lengths = length_totals
        .into_iter()
        .map(|(field, (sum, n))| (field.to_string(), round2(sum as f64 / n as f64)))
        .collect();

    report
}

pub async fn validate(store: &dyn DocumentStore, today: NaiveDate) -> Result<ValidationReport, StoreError> {
    let documents = store.documents().await?;
    Ok(validation_report(&store.describe(), &documents, today))
}
