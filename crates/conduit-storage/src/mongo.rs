//! MongoDB backend: one document per natural key, unique index on `natural_key`.

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Document};
use chrono::{DateTime, Utc};
use conduit_core::{CanonicalRecord, EnrichedRecord, EtlMetadata, NaturalKey, StoredDocument, UpsertOutcome};
use futures_util::TryStreamExt;
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::documents::{validate_name, DocumentStore, StoreError};

/// Document layout as persisted; `_id` is assigned by MongoDB on first insert.
#[derive(Debug, Deserialize)]
struct MongoRow {
    #[serde(rename = "_id")]
    id: ObjectId,
    natural_key: NaturalKey,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    created_at: DateTime<Utc>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    updated_at: DateTime<Utc>,
    record: CanonicalRecord,
    etl_metadata: EtlMetadata,
}

impl From<MongoRow> for StoredDocument {
    fn from(row: MongoRow) -> Self {
        StoredDocument {
            id: row.id.to_hex(),
            natural_key: row.natural_key,
            created_at: row.created_at,
            updated_at: row.updated_at,
            document: EnrichedRecord {
                record: row.record,
                etl_metadata: row.etl_metadata,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct MongoDocumentStore {
    client: Client,
    database: String,
    collection: Collection<Document>,
}

impl MongoDocumentStore {
    /// Connect, ping, and make sure the collection's indexes exist.
    pub async fn connect(url: &str, database: &str, collection: &str) -> Result<Self, StoreError> {
        validate_name("database", database)?;
        validate_name("collection", collection)?;

        let client = Client::with_uri_str(url).await?;
        client.database(database).run_command(doc! { "ping": 1 }).await?;
        info!(database, collection, "connected to mongodb");

        let store = Self {
            collection: client.database(database).collection::<Document>(collection),
            database: database.to_string(),
            client,
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let unique = IndexModel::builder()
            .keys(doc! { "natural_key": 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .name("natural_key_unique".to_string())
                    .build(),
            )
            .build();
        self.collection.create_index(unique).await?;

        // Query helpers for the validation report; failing to build them is not fatal.
        for keys in [
            doc! { "etl_metadata.ingestion_date": 1 },
            doc! { "etl_metadata.source": 1 },
        ] {
            let index = IndexModel::builder().keys(keys).build();
            if let Err(err) = self.collection.create_index(index).await {
                warn!(error = %err, "failed to create secondary index");
            }
        }
        Ok(())
    }

    fn decode(document: Document) -> Result<StoredDocument, StoreError> {
        bson::from_document::<MongoRow>(document)
            .map(StoredDocument::from)
            .map_err(|err| StoreError::Decode(err.to_string()))
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    fn describe(&self) -> String {
        format!("mongodb {}.{}", self.database, self.collection.name())
    }

    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StoredDocument>, StoreError> {
        self.collection
            .find_one(doc! { "natural_key": key.as_str() })
            .await?
            .map(Self::decode)
            .transpose()
    }

    async fn upsert(&self, key: &NaturalKey, record: &EnrichedRecord) -> Result<UpsertOutcome, StoreError> {
        let now = bson::DateTime::from_chrono(Utc::now());
        let source_fields =
            bson::to_bson(&record.record).map_err(|err| StoreError::Encode(err.to_string()))?;
        let metadata =
            bson::to_bson(&record.etl_metadata).map_err(|err| StoreError::Encode(err.to_string()))?;

        let result = self
            .collection
            .update_one(
                doc! { "natural_key": key.as_str() },
                doc! {
                    "$set": {
                        "record": source_fields,
                        "etl_metadata": metadata,
                        "updated_at": now,
                    },
                    "$setOnInsert": { "created_at": now },
                },
            )
            .upsert(true)
            .await?;

        let outcome = if result.upserted_id.is_some() {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        };
        debug!(natural_key = %key, ?outcome, "mongodb upsert");
        Ok(outcome)
    }

    async fn documents(&self) -> Result<Vec<StoredDocument>, StoreError> {
        let mut cursor = self.collection.find(doc! {}).await?;
        let mut out = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            out.push(Self::decode(document)?);
        }
        Ok(out)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.client.clone().shutdown().await;
        info!(database = %self.database, "mongodb connection closed");
        Ok(())
    }
}
