//! Natural keys. Derived only from canonical fields, never from ingestion metadata.

use conduit_core::{Article, CanonicalRecord, KeyError, NaturalKey, PhishEntry};
use sha2::{Digest, Sha256};

const URL_DIGEST_CHARS: usize = 16;

pub fn derive_key(record: &CanonicalRecord) -> Result<NaturalKey, KeyError> {
    match record {
        CanonicalRecord::Phish(entry) => phish_key(entry),
        CanonicalRecord::Article(article) => article_key(article),
    }
}

fn phish_key(entry: &PhishEntry) -> Result<NaturalKey, KeyError> {
    let id = entry.phish_id.trim();
    if id.is_empty() {
        return Err(KeyError::MissingField {
            data_type: "phish_entry",
            field: "phish_id",
        });
    }
    if id.chars().all(|c| c.is_ascii_digit()) {
        let stripped = id.trim_start_matches('0');
        return NaturalKey::new(if stripped.is_empty() { "0" } else { stripped });
    }
    NaturalKey::new(id)
}

/// `news:<url digest>:<YYYYMMDD | undated>`
fn article_key(article: &Article) -> Result<NaturalKey, KeyError> {
    let url = canonical_url(&article.url);
    if url.is_empty() {
        return Err(KeyError::MissingField {
            data_type: "news_article",
            field: "url",
        });
    }

    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    let bucket = if article.published_date.is_empty() {
        "undated".to_string()
    } else {
        article.published_date.replace('-', "")
    };
    NaturalKey::new(format!("news:{}:{bucket}", &digest[..URL_DIGEST_CHARS]))
}

/// Lowercase scheme and host, no fragment, no trailing slash on the path.
pub fn canonical_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or_default();

    let Some((scheme, rest)) = without_fragment.split_once("://") else {
        return without_fragment.trim_end_matches('/').to_string();
    };
    let (authority, tail) = match rest.find(['/', '?']) {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    let (path, query) = match tail.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (tail, None),
    };

    let mut out = format!(
        "{}://{}{}",
        scheme.to_ascii_lowercase(),
        authority.to_ascii_lowercase(),
        path.trim_end_matches('/')
    );
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        out.push('?');
        out.push_str(query);
    }
    out
}
