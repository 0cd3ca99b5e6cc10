//! NewsAPI-style JSON feed: `{ "status": "ok", "articles": [ ... ] }`.
//!
//! | canonical field  | JSON path      | coercion          |
//! |------------------|----------------|-------------------|
//! | `title`          | `title`        | text              |
//! | `description`    | `description`  | text              |
//! | `content`        | `content`      | text              |
//! | `url`            | `url`          | text, key field   |
//! | `url_to_image`   | `urlToImage`   | text              |
//! | `published_at`   | `publishedAt`  | timestamp         |
//! | `published_date` | `publishedAt`  | UTC date or `""`  |
//! | `author`         | `author`       | text              |
//! | `source.id`      | `source.id`    | text              |
//! | `source.name`    | `source.name`  | text              |

use conduit_core::{Article, ArticleSource, CanonicalRecord, NormalizationError, RawRecord};
use conduit_storage::FetchRequest;
use serde_json::Value;

use crate::fields::{nested, text, timestamp, type_name, Object};
use crate::{AdapterError, FeedAdapter, FeedKind, SourceSettings};

pub const KEY_FIELD: &str = "url";

const DEFAULT_QUERY: [(&str, &str); 2] = [("country", "us"), ("pageSize", "100")];

#[derive(Debug, Clone, Copy, Default)]
pub struct NewsApiAdapter;

fn article_source(obj: &Object) -> ArticleSource {
    match nested(obj, "source") {
        Some(source) => ArticleSource {
            id: text(source, "id"),
            name: text(source, "name"),
        },
        None => ArticleSource::default(),
    }
}

impl FeedAdapter for NewsApiAdapter {
    fn kind(&self) -> FeedKind {
        FeedKind::Newsapi
    }

    fn data_type(&self) -> &'static str {
        "news_article"
    }

    fn payload_extension(&self) -> &'static str {
        "json"
    }

    fn fetch_request(&self, settings: &SourceSettings) -> Result<FetchRequest, AdapterError> {
        let api_key = settings
            .api_key
            .as_deref()
            .map(|k| k.trim().trim_matches('"'))
            .filter(|k| !k.is_empty())
            .ok_or(AdapterError::MissingApiKey)?;

        let mut request = FetchRequest::get(settings.url.clone())
            .with_header("X-Api-Key", api_key)
            .with_header("Accept", "application/json");
        for (name, value) in DEFAULT_QUERY {
            if !settings.query.contains_key(name) {
                request = request.with_query(name, value);
            }
        }
        for (name, value) in &settings.query {
            request = request.with_query(name.clone(), value.clone());
        }
        Ok(request)
    }

    fn parse_payload(&self, bytes: &[u8]) -> Result<Vec<RawRecord>, AdapterError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let mut envelope = match value {
            Value::Object(envelope) => envelope,
            other => {
                return Err(AdapterError::Shape(format!(
                    "top-level payload is {}, expected object",
                    type_name(&other)
                )))
            }
        };

        let status = text(&envelope, "status");
        if status != "ok" {
            return Err(AdapterError::FeedStatus {
                status: if status.is_empty() { "missing".to_string() } else { status },
                code: text(&envelope, "code"),
                message: text(&envelope, "message"),
            });
        }

        match envelope.remove("articles") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items),
            Some(other) => Err(AdapterError::Shape(format!(
                "`articles` is {}, expected array",
                type_name(&other)
            ))),
        }
    }

    fn normalize(&self, raw: &RawRecord) -> Result<CanonicalRecord, NormalizationError> {
        let obj = raw.as_object().ok_or(NormalizationError::NotAnObject {
            found: type_name(raw),
        })?;
        if !obj.contains_key(KEY_FIELD) {
            return Err(NormalizationError::MissingKeyField { field: KEY_FIELD });
        }

        let (published_at, parsed) = timestamp(obj, "publishedAt");
        let published_date = parsed
            .map(|at| at.format("%Y-%m-%d").to_string())
            .unwrap_or_default();

        Ok(CanonicalRecord::Article(Article {
            title: text(obj, "title"),
            description: text(obj, "description"),
            content: text(obj, "content"),
            url: text(obj, KEY_FIELD),
            url_to_image: text(obj, "urlToImage"),
            published_at,
            published_date,
            author: text(obj, "author"),
            source: article_source(obj),
        }))
    }
}
