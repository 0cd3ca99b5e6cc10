//! The document store seam: find-by-key plus single-document upsert under a unique key.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use conduit_core::{EnrichedRecord, NaturalKey, StoredDocument, UpsertOutcome};
use mongodb::error::{ErrorKind, RETRYABLE_WRITE_ERROR};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::mongo::MongoDocumentStore;
use crate::postgres::PgDocumentStore;
use crate::RetryPolicy;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unsupported store url `{0}` (expected mongodb://, postgres:// or memory://)")]
    UnsupportedUrl(String),
    #[error("invalid {kind} name `{name}`")]
    InvalidName { kind: &'static str, name: String },
    #[error("mongodb: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("postgres: {0}")]
    Postgres(#[from] sqlx::Error),
    #[error("encoding document: {0}")]
    Encode(String),
    #[error("decoding document: {0}")]
    Decode(String),
    #[error("store {operation} did not finish within {after:?}")]
    Timeout { operation: &'static str, after: Duration },
}

impl StoreError {
    /// Failures worth another attempt: timeouts and connection-level backend errors.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Timeout { .. } => true,
            StoreError::Mongo(err) => {
                matches!(*err.kind, ErrorKind::Io(_) | ErrorKind::ServerSelection { .. })
                    || err.contains_label(RETRYABLE_WRITE_ERROR)
            }
            StoreError::Postgres(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// Key-value collection of enriched documents with a unique index over the natural key.
///
/// Implementations rely on the backend's per-document atomicity for upserts; callers
/// never lock around them.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Human-readable target, e.g. `mongodb etl_database.newsapi`.
    fn describe(&self) -> String;

    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StoredDocument>, StoreError>;

    /// Insert when the key is absent, otherwise overwrite the record and metadata in place.
    async fn upsert(&self, key: &NaturalKey, record: &EnrichedRecord) -> Result<UpsertOutcome, StoreError>;

    async fn documents(&self) -> Result<Vec<StoredDocument>, StoreError>;

    /// Release the underlying connection. Further calls are not expected.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Where a collection lives: connection string, database (or schema) and collection (or table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreTarget {
    pub url: String,
    pub database: String,
    pub collection: String,
}

/// Open the backend selected by the connection string scheme.
pub async fn open_document_store(target: &StoreTarget) -> Result<Box<dyn DocumentStore>, StoreError> {
    validate_name("database", &target.database)?;
    validate_name("collection", &target.collection)?;

    let url = target.url.trim();
    if url.starts_with("mongodb://") || url.starts_with("mongodb+srv://") {
        let store = MongoDocumentStore::connect(url, &target.database, &target.collection).await?;
        Ok(Box::new(store))
    } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let store = PgDocumentStore::connect(url, &target.database, &target.collection).await?;
        Ok(Box::new(store))
    } else if url.starts_with("memory://") {
        Ok(Box::new(MemoryDocumentStore::named(&target.collection)))
    } else {
        Err(StoreError::UnsupportedUrl(target.url.clone()))
    }
}

/// Names end up inside SQL identifiers and collection paths, so only `[A-Za-z0-9_]` is accepted.
pub(crate) fn validate_name(kind: &'static str, name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

/// Per-call deadline and retry budget for store operations.
#[derive(Debug, Clone, Copy)]
pub struct StoreCallPolicy {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for StoreCallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry: RetryPolicy {
                max_retries: 2,
                delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
            },
        }
    }
}

/// Wraps a store so every lookup and write gets a deadline and a bounded retry on
/// transient failures. Upserts are idempotent per key, so repeating one is safe.
pub struct GuardedStore {
    inner: Box<dyn DocumentStore>,
    policy: StoreCallPolicy,
}

impl GuardedStore {
    pub fn new(inner: Box<dyn DocumentStore>, policy: StoreCallPolicy) -> Self {
        Self { inner, policy }
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(self.policy.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout {
                    operation,
                    after: self.policy.timeout,
                }),
            };
            match outcome {
                Err(err) if err.is_transient() && attempt < self.policy.retry.max_retries => {
                    let wait = self.policy.retry.delay_for_attempt(attempt);
                    warn!(operation, attempt, error = %err, wait_ms = wait.as_millis() as u64, "retrying store call");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl DocumentStore for GuardedStore {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StoredDocument>, StoreError> {
        self.call("find_by_key", || self.inner.find_by_key(key)).await
    }

    async fn upsert(&self, key: &NaturalKey, record: &EnrichedRecord) -> Result<UpsertOutcome, StoreError> {
        self.call("upsert", || self.inner.upsert(key, record)).await
    }

    async fn documents(&self) -> Result<Vec<StoredDocument>, StoreError> {
        self.call("documents", || self.inner.documents()).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}

/// Process-local store. Clones share the same documents.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    name: String,
    documents: Arc<Mutex<BTreeMap<NaturalKey, StoredDocument>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::named("documents")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            documents: Arc::default(),
        }
    }

    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.lock().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn describe(&self) -> String {
        format!("memory {}", self.name)
    }

    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.documents.lock().await.get(key).cloned())
    }

    async fn upsert(&self, key: &NaturalKey, record: &EnrichedRecord) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let mut documents = self.documents.lock().await;
        match documents.get_mut(key) {
            Some(existing) => {
                existing.document = record.clone();
                existing.updated_at = now;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                documents.insert(
                    key.clone(),
                    StoredDocument {
                        id: Uuid::new_v4().to_string(),
                        natural_key: key.clone(),
                        created_at: now,
                        updated_at: now,
                        document: record.clone(),
                    },
                );
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn documents(&self) -> Result<Vec<StoredDocument>, StoreError> {
        Ok(self.documents.lock().await.values().cloned().collect())
    }
}
