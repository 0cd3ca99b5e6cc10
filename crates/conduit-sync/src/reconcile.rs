use conduit_core::{EnrichedRecord, UpsertOutcome};
use conduit_storage::DocumentStore;
use serde::Serialize;
use tracing::{debug, warn};

use crate::identity::derive_key;

/// Per-batch write tallies. `updated` counts every write to an existing key;
/// `unchanged` is the subset whose content matched the stored document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileResult {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub errors: usize,
    pub key_errors: usize,
    pub store_errors: usize,
}

impl ReconcileResult {
    pub fn loaded(&self) -> usize {
        self.inserted + self.updated
    }
}

/// One upsert per keyed record, in input order. Per-record failures are counted, never returned.
pub async fn reconcile(records: &[EnrichedRecord], store: &dyn DocumentStore) -> ReconcileResult {
    let mut result = ReconcileResult::default();

    for (index, record) in records.iter().enumerate() {
        let key = match derive_key(&record.record) {
            Ok(key) => key,
            Err(err) => {
                warn!(index, error = %err, "dropping record without a natural key");
                result.key_errors += 1;
                result.errors += 1;
                continue;
            }
        };

        let previous = match store.find_by_key(&key).await {
            Ok(previous) => previous,
            Err(err) => {
                warn!(index, key = %key, error = %err, "lookup failed; skipping record");
                result.store_errors += 1;
                result.errors += 1;
                continue;
            }
        };

        match store.upsert(&key, record).await {
            Ok(UpsertOutcome::Inserted) => {
                debug!(key = %key, "inserted");
                result.inserted += 1;
            }
            Ok(UpsertOutcome::Updated) => {
                result.updated += 1;
                if previous.is_some_and(|stored| stored.document.content_eq(record)) {
                    result.unchanged += 1;
                }
            }
            Err(err) => {
                warn!(index, key = %key, error = %err, "upsert failed; skipping record");
                result.store_errors += 1;
                result.errors += 1;
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::enrich;
    use crate::testing::{at, FlakyStore};
    use conduit_core::{CanonicalRecord, PhishEntry};
    use conduit_storage::{GuardedStore, MemoryDocumentStore, RetryPolicy, StoreCallPolicy};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn entry(id: &str, target: &str) -> CanonicalRecord {
        CanonicalRecord::Phish(PhishEntry {
            phish_id: id.into(),
            url: format!("http://phish-{id}.test/"),
            target: target.into(),
            ..Default::default()
        })
    }

    fn batch(records: &[CanonicalRecord], day: u32) -> Vec<EnrichedRecord> {
        records
            .iter()
            .cloned()
            .map(|r| enrich(r, at(day), "phishtank"))
            .collect()
    }

    #[tokio::test]
    async fn row_without_id_is_counted_and_skipped() {
        let store = MemoryDocumentStore::new();
        let rows = [entry("101", "Bank"), entry("", "Mail"), entry("103", "")];

        let result = reconcile(&batch(&rows, 1), &store).await;

        assert_eq!(result.inserted, 2);
        assert_eq!(result.updated, 0);
        assert_eq!(result.errors, 1);
        assert_eq!(result.key_errors, 1);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn rerun_updates_every_row_and_keeps_quality_block() {
        let store = MemoryDocumentStore::new();
        let first_rows = [entry("101", "Bank"), entry("", "Mail"), entry("103", "")];
        reconcile(&batch(&first_rows, 1), &store).await;
        let before = store.documents().await.unwrap();

        // Row 2 shares its id with row 1 on the second pass.
        let second_rows = [entry("101", "Bank"), entry("101", "Bank"), entry("103", "")];
        let result = reconcile(&batch(&second_rows, 2), &store).await;

        assert_eq!(result.inserted, 0);
        assert_eq!(result.updated, 3);
        assert_eq!(result.errors, 0);
        assert_eq!(result.unchanged, 3);

        let after = store.documents().await.unwrap();
        assert_eq!(after.len(), 2);
        for (old, new) in before.iter().zip(&after) {
            assert_eq!(old.natural_key, new.natural_key);
            assert_eq!(old.id, new.id);
            assert_eq!(
                old.document.etl_metadata.data_quality,
                new.document.etl_metadata.data_quality
            );
            assert_ne!(
                old.document.etl_metadata.ingestion_timestamp,
                new.document.etl_metadata.ingestion_timestamp
            );
        }
    }

    #[tokio::test]
    async fn changed_content_is_an_update_but_not_unchanged() {
        let store = MemoryDocumentStore::new();
        reconcile(&batch(&[entry("7", "Bank")], 1), &store).await;

        let result = reconcile(&batch(&[entry("7", "Other Bank")], 2), &store).await;

        assert_eq!(result.updated, 1);
        assert_eq!(result.unchanged, 0);
        let stored = store.documents().await.unwrap();
        assert_eq!(
            stored[0].document.etl_metadata.data_quality.lengths["target"],
            "Other Bank".len()
        );
    }

    #[tokio::test]
    async fn key_failures_are_contained() {
        let store = MemoryDocumentStore::new();
        let rows: Vec<_> = (0..10)
            .map(|i| {
                if i % 3 == 0 {
                    entry("", "none")
                } else {
                    entry(&i.to_string(), "t")
                }
            })
            .collect();

        let result = reconcile(&batch(&rows, 1), &store).await;

        assert_eq!(result.errors, 4);
        assert_eq!(result.loaded(), rows.len() - 4);
    }

    #[tokio::test]
    async fn store_failures_do_not_abort_the_batch() {
        let store = FlakyStore::failing_on(&["2"]);
        let rows = [entry("1", "a"), entry("2", "b"), entry("3", "c")];

        let result = reconcile(&batch(&rows, 1), &store).await;

        assert_eq!(result.inserted, 2);
        assert_eq!(result.store_errors, 1);
        assert_eq!(result.errors, 1);
        assert_eq!(store.inner.len().await, 2);
    }

    #[tokio::test]
    async fn timed_out_write_is_retried_and_lands() {
        let flaky = FlakyStore::timing_out_once(&["2"]);
        let backing = flaky.inner.clone();
        let upserts = flaky.upserts.clone();
        let store = GuardedStore::new(
            Box::new(flaky),
            StoreCallPolicy {
                timeout: Duration::from_secs(1),
                retry: RetryPolicy {
                    max_retries: 2,
                    delay: Duration::from_millis(5),
                    ..Default::default()
                },
            },
        );
        let rows = [entry("1", "a"), entry("2", "b"), entry("3", "c")];

        let result = reconcile(&batch(&rows, 1), &store).await;

        assert_eq!(result.inserted, 3);
        assert_eq!(result.store_errors, 0);
        assert_eq!(result.errors, 0);
        assert_eq!(backing.len().await, 3);
        assert_eq!(upserts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn without_retry_budget_a_timed_out_write_is_a_store_error() {
        let flaky = FlakyStore::timing_out_once(&["2"]);
        let store = GuardedStore::new(
            Box::new(flaky),
            StoreCallPolicy {
                timeout: Duration::from_secs(1),
                retry: RetryPolicy {
                    max_retries: 0,
                    ..Default::default()
                },
            },
        );
        let rows = [entry("1", "a"), entry("2", "b")];

        let result = reconcile(&batch(&rows, 1), &store).await;

        assert_eq!(result.inserted, 1);
        assert_eq!(result.store_errors, 1);
    }
}
