//! PostgreSQL backend: a JSONB table per collection with a unique `natural_key` column.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::{CanonicalRecord, EnrichedRecord, EtlMetadata, NaturalKey, StoredDocument, UpsertOutcome};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::documents::{validate_name, DocumentStore, StoreError};

#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    schema: String,
    table: String,
}

impl PgDocumentStore {
    /// Connect and create the schema and table if needed. `schema` plays the role of the database name.
    pub async fn connect(url: &str, schema: &str, table: &str) -> Result<Self, StoreError> {
        validate_name("database", schema)?;
        validate_name("collection", table)?;

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        info!(schema, table, "connected to postgres");

        let store = Self {
            pool,
            schema: schema.to_string(),
            table: table.to_string(),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    fn qualified_table(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.table)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id UUID PRIMARY KEY,
                natural_key TEXT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                record JSONB NOT NULL,
                etl_metadata JSONB NOT NULL
            )",
            self.qualified_table()
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn decode(row: &PgRow) -> Result<StoredDocument, StoreError> {
        let id: Uuid = row.try_get("id")?;
        let natural_key: String = row.try_get("natural_key")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
        let Json(record): Json<CanonicalRecord> = row.try_get("record")?;
        let Json(etl_metadata): Json<EtlMetadata> = row.try_get("etl_metadata")?;

        Ok(StoredDocument {
            id: id.to_string(),
            natural_key: NaturalKey::new(natural_key).map_err(|err| StoreError::Decode(err.to_string()))?,
            created_at,
            updated_at,
            document: EnrichedRecord { record, etl_metadata },
        })
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    fn describe(&self) -> String {
        format!("postgres {}.{}", self.schema, self.table)
    }

    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StoredDocument>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT id, natural_key, created_at, updated_at, record, etl_metadata
             FROM {} WHERE natural_key = $1",
            self.qualified_table()
        ))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn upsert(&self, key: &NaturalKey, record: &EnrichedRecord) -> Result<UpsertOutcome, StoreError> {
        // xmax is zero only for a freshly inserted row version.
        let row = sqlx::query(&format!(
            "INSERT INTO {} (id, natural_key, created_at, updated_at, record, etl_metadata)
             VALUES ($1, $2, $3, $3, $4, $5)
             ON CONFLICT (natural_key) DO UPDATE
               SET record = EXCLUDED.record,
                   etl_metadata = EXCLUDED.etl_metadata,
                   updated_at = EXCLUDED.updated_at
             RETURNING (xmax = 0) AS inserted",
            self.qualified_table()
        ))
        .bind(Uuid::new_v4())
        .bind(key.as_str())
        .bind(Utc::now())
        .bind(Json(&record.record))
        .bind(Json(&record.etl_metadata))
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        let outcome = if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        };
        debug!(natural_key = %key, ?outcome, "postgres upsert");
        Ok(outcome)
    }

    async fn documents(&self) -> Result<Vec<StoredDocument>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT id, natural_key, created_at, updated_at, record, etl_metadata
             FROM {} ORDER BY natural_key",
            self.qualified_table()
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::decode).collect()
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        info!(schema = %self.schema, "postgres pool closed");
        Ok(())
    }
}
