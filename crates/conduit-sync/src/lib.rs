//! Sync pipeline: fetch, normalize, enrich, reconcile, report.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use conduit_adapters::{adapter_for_kind, AdapterError, FeedAdapter, FeedKind, SourceSettings};
use conduit_storage::{
    open_document_store, DocumentStore, FetchError, GuardedStore, HttpClientConfig, PayloadFetcher, RetryPolicy,
    StoreCallPolicy, StoreError, StoreTarget,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod enrich;
pub mod identity;
pub mod reconcile;
pub mod validate;

pub use enrich::{enrich, CONNECTOR_VERSION};
pub use identity::{canonical_url, derive_key};
pub use reconcile::{reconcile, ReconcileResult};
pub use validate::{validate, validation_report, OriginCount, ValidationReport};

pub const CRATE_NAME: &str = "conduit-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text).context("parsing source registry")?;
        let mut seen = std::collections::BTreeSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                anyhow::bail!("duplicate source_id `{}` in registry", source.source_id);
            }
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn find(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub kind: FeedKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub url: String,
    pub collection: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// Name of the environment variable holding the API key, never the key itself.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    /// Resolve adapter settings; `lookup` maps a variable name to its value.
    pub fn settings(&self, lookup: impl Fn(&str) -> Option<String>) -> SourceSettings {
        SourceSettings {
            url: self.url.clone(),
            query: self.query.clone(),
            api_key: self.api_key_env.as_deref().and_then(lookup),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub store_url: String,
    pub database: String,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub rate_limit_delay_ms: u64,
    pub user_agent: String,
    pub store_timeout_secs: u64,
    pub store_max_retries: usize,
    pub store_retry_delay_ms: u64,
    pub reports_dir: Option<PathBuf>,
    pub workspace_root: PathBuf,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            store_url: "mongodb://localhost:27017/".to_string(),
            database: "etl_database".to_string(),
            http_timeout_secs: 30,
            max_retries: 3,
            retry_delay_ms: 2000,
            rate_limit_delay_ms: 1000,
            user_agent: format!("conduit/{CONNECTOR_VERSION}"),
            store_timeout_secs: 10,
            store_max_retries: 2,
            store_retry_delay_ms: 500,
            reports_dir: None,
            workspace_root: PathBuf::from("."),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl ConnectorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store_url: std::env::var("CONDUIT_STORE_URL")
                .or_else(|_| std::env::var("MONGODB_URI"))
                .unwrap_or(defaults.store_url),
            database: std::env::var("CONDUIT_DATABASE").unwrap_or(defaults.database),
            http_timeout_secs: env_parse("HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            max_retries: env_parse("MAX_RETRIES").unwrap_or(defaults.max_retries),
            retry_delay_ms: env_parse("RETRY_DELAY_MS").unwrap_or(defaults.retry_delay_ms),
            rate_limit_delay_ms: env_parse("RATE_LIMIT_DELAY_MS").unwrap_or(defaults.rate_limit_delay_ms),
            user_agent: std::env::var("CONDUIT_USER_AGENT").unwrap_or(defaults.user_agent),
            store_timeout_secs: env_parse("STORE_TIMEOUT_SECS").unwrap_or(defaults.store_timeout_secs),
            store_max_retries: env_parse("STORE_MAX_RETRIES").unwrap_or(defaults.store_max_retries),
            store_retry_delay_ms: env_parse("STORE_RETRY_DELAY_MS").unwrap_or(defaults.store_retry_delay_ms),
            reports_dir: std::env::var("REPORTS_DIR").ok().map(PathBuf::from),
            workspace_root: std::env::var("CONDUIT_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                delay: Duration::from_millis(self.retry_delay_ms),
                ..Default::default()
            },
            request_delay: Duration::from_millis(self.rate_limit_delay_ms),
        }
    }

    pub fn store_call_policy(&self) -> StoreCallPolicy {
        StoreCallPolicy {
            timeout: Duration::from_secs(self.store_timeout_secs),
            retry: RetryPolicy {
                max_retries: self.store_max_retries,
                delay: Duration::from_millis(self.store_retry_delay_ms),
                ..Default::default()
            },
        }
    }

    pub fn store_target(&self, source: &SourceConfig) -> StoreTarget {
        StoreTarget {
            url: self.store_url.clone(),
            database: self.database.clone(),
            collection: source.collection.clone(),
        }
    }
}

/// Run-level failures. Per-record problems are counted in [`RunSummary`] instead.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("fetching {source_id}: {source}")]
    Fetch {
        source_id: String,
        #[source]
        source: FetchError,
    },
    #[error("{source_id} refused to serve data: {source}")]
    Feed {
        source_id: String,
        #[source]
        source: AdapterError,
    },
    #[error("parsing {source_id} payload: {source}")]
    Parse {
        source_id: String,
        #[source]
        source: AdapterError,
    },
    #[error("opening store {target}: {source}")]
    Store {
        target: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    CompletedWithErrors,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub collection: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub extracted: usize,
    pub transformed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub errors: usize,
    pub normalization_errors: usize,
    pub key_errors: usize,
    pub store_errors: usize,
    pub status: RunStatus,
    /// sha256 of the fetched payload, for telling apart runs over identical feed snapshots.
    pub payload_sha256: String,
    pub payload_bytes: usize,
}

impl RunSummary {
    pub fn loaded(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn one_line(&self) -> String {
        format!(
            "{} -> {}: extracted={} transformed={} inserted={} updated={} unchanged={} errors={} ({} ms)",
            self.source_id,
            self.collection,
            self.extracted,
            self.transformed,
            self.inserted,
            self.updated,
            self.unchanged,
            self.errors,
            self.duration_ms
        )
    }
}

/// One source, one pass: fetch, parse, normalize, enrich, reconcile.
pub struct BatchRunner {
    source_id: String,
    settings: SourceSettings,
    adapter: Box<dyn FeedAdapter>,
    fetcher: Arc<dyn PayloadFetcher>,
}

impl BatchRunner {
    pub fn new(
        source_id: impl Into<String>,
        settings: SourceSettings,
        adapter: Box<dyn FeedAdapter>,
        fetcher: Arc<dyn PayloadFetcher>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            settings,
            adapter,
            fetcher,
        }
    }

    pub async fn run(&self, store: &dyn DocumentStore) -> Result<RunSummary, RunError> {
        self.run_at(store, Utc::now()).await
    }

    /// `now` stamps every record of the batch; it does not influence keys.
    pub async fn run_at(&self, store: &dyn DocumentStore, now: DateTime<Utc>) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source_id = %self.source_id);
        self.run_inner(run_id, store, now).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        store: &dyn DocumentStore,
        now: DateTime<Utc>,
    ) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let source_id = self.source_id.clone();

        let request = self
            .adapter
            .fetch_request(&self.settings)
            .map_err(|source| RunError::Feed {
                source_id: source_id.clone(),
                source,
            })?;
        let response = self
            .fetcher
            .fetch(&source_id, &request)
            .await
            .map_err(|source| RunError::Fetch {
                source_id: source_id.clone(),
                source,
            })?;
        info!(bytes = response.body.len(), url = %response.final_url, "payload fetched");

        let payload_sha256 = hex::encode(Sha256::digest(&response.body));
        let payload_bytes = response.body.len();

        let raw = self.adapter.parse_payload(&response.body).map_err(|source| {
            if source.is_feed_failure() {
                RunError::Feed {
                    source_id: source_id.clone(),
                    source,
                }
            } else {
                RunError::Parse {
                    source_id: source_id.clone(),
                    source,
                }
            }
        })?;

        let extracted = raw.len();
        let mut normalization_errors = 0usize;
        let mut enriched = Vec::with_capacity(extracted);
        for (index, item) in raw.iter().enumerate() {
            match self.adapter.normalize(item) {
                Ok(record) => enriched.push(enrich::enrich(record, now, &source_id)),
                Err(err) => {
                    warn!(index, error = %err, "dropping record that failed normalization");
                    normalization_errors += 1;
                }
            }
        }
        let transformed = enriched.len();

        let result = reconcile::reconcile(&enriched, store).await;
        let errors = normalization_errors + result.errors;
        let status = if errors == 0 {
            RunStatus::Succeeded
        } else {
            RunStatus::CompletedWithErrors
        };

        let summary = RunSummary {
            run_id,
            source_id,
            collection: store.describe(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            extracted,
            transformed,
            inserted: result.inserted,
            updated: result.updated,
            unchanged: result.unchanged,
            errors,
            normalization_errors,
            key_errors: result.key_errors,
            store_errors: result.store_errors,
            status,
            payload_sha256,
            payload_bytes,
        };
        info!(
            extracted,
            transformed,
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            errors,
            "sync run finished"
        );
        Ok(summary)
    }
}

fn describe_target(target: &StoreTarget) -> String {
    format!("{}.{}", target.database, target.collection)
}

/// Open the store, run one batch, close the store whatever the outcome, then write reports.
pub async fn run_source(
    config: &ConnectorConfig,
    source: &SourceConfig,
    settings: SourceSettings,
    fetcher: Arc<dyn PayloadFetcher>,
) -> Result<RunSummary, RunError> {
    let target = config.store_target(source);
    let store = open_document_store(&target)
        .await
        .map_err(|source| RunError::Store {
            target: describe_target(&target),
            source,
        })?;
    let store = GuardedStore::new(store, config.store_call_policy());

    let runner = BatchRunner::new(source.source_id.clone(), settings, adapter_for_kind(source.kind), fetcher);
    let outcome = runner.run(&store).await;
    if let Err(err) = store.close().await {
        warn!(error = %err, store = %store.describe(), "closing store failed");
    }

    if let (Ok(summary), Some(dir)) = (&outcome, &config.reports_dir) {
        if let Err(err) = write_run_report(dir, summary).await {
            warn!(error = %err, "could not write run report");
        }
    }
    outcome
}

/// Validation report for one source's collection, with the same open/close scope as a run.
pub async fn validate_source(
    config: &ConnectorConfig,
    source: &SourceConfig,
    today: NaiveDate,
) -> Result<ValidationReport> {
    let target = config.store_target(source);
    let store = open_document_store(&target)
        .await
        .with_context(|| format!("opening store {}", describe_target(&target)))?;
    let store = GuardedStore::new(store, config.store_call_policy());
    let report = validate::validate(&store, today).await;
    if let Err(err) = store.close().await {
        warn!(error = %err, "closing store failed");
    }
    report.with_context(|| format!("scanning {}", describe_target(&target)))
}

/// Writes `<reports_dir>/<run_id>/run_summary.json` and `run_brief.md`.
pub async fn write_run_report(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    let status = match summary.status {
        RunStatus::Succeeded => "succeeded",
        RunStatus::CompletedWithErrors => "completed with errors",
    };
    let brief = format!(
        "# Conduit Run Brief\n\n- Run ID: `{}`\n- Source: {}\n- Collection: {}\n- Started: {}\n- Finished: {}\n- Status: {}\n\n## Counts\n- extracted: {}\n- transformed: {}\n- inserted: {}\n- updated: {}\n- unchanged: {}\n- errors: {} (normalization {}, key {}, store {})\n\n## Payload\n- sha256: `{}`\n- bytes: {}\n",
        summary.run_id,
        summary.source_id,
        summary.collection,
        summary.started_at,
        summary.finished_at,
        status,
        summary.extracted,
        summary.transformed,
        summary.inserted,
        summary.updated,
        summary.unchanged,
        summary.errors,
        summary.normalization_errors,
        summary.key_errors,
        summary.store_errors,
        summary.payload_sha256,
        summary.payload_bytes
    );
    fs::write(run_dir.join("run_brief.md"), brief)
        .await
        .context("writing run_brief.md")?;

    Ok(run_dir)
}
