//! Brings the persisted `tee_times` rows for one date in line with a fresh crawl.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use fairway_core::{Listing, TeeTimeRecord, TEE_TIMES};
use fairway_storage::{DocumentStore, WriteOp};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Persisted rows keyed by document key. `None` marks a row that no longer deserializes.
pub type ExistingRecords = BTreeMap<String, Option<TeeTimeRecord>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcilePlan {
    pub deletes: Vec<String>,
    pub upserts: Vec<TeeTimeRecord>,
    pub unchanged: usize,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.upserts.is_empty()
    }

    /// Deletes first, then upserts stamped with `crawled_at`.
    pub fn write_ops(&self, crawled_at: DateTime<Utc>) -> Result<Vec<WriteOp>> {
        let mut ops = Vec::with_capacity(self.deletes.len() + self.upserts.len());
        for key in &self.deletes {
            ops.push(WriteOp::Delete {
                collection: TEE_TIMES.to_string(),
                key: key.clone(),
            });
        }
        for record in &self.upserts {
            let stamped = TeeTimeRecord {
                crawled_at: Some(crawled_at),
                ..record.clone()
            };
            ops.push(WriteOp::Set {
                collection: TEE_TIMES.to_string(),
                key: stamped.key(),
                data: serde_json::to_value(&stamped).context("serializing tee time")?,
            });
        }
        Ok(ops)
    }
}

/// Pure diff of a crawl against the persisted rows for the same date.
///
/// When two listings map to one key the first in crawl order wins, which for sorted
/// input is the cheapest.
pub fn plan_reconcile(listings: &[Listing], existing: &ExistingRecords) -> ReconcilePlan {
    let mut fresh: BTreeMap<String, TeeTimeRecord> = BTreeMap::new();
    for listing in listings {
        let record = TeeTimeRecord::from_listing(listing);
        fresh.entry(record.key()).or_insert(record);
    }

    let deletes = existing
        .keys()
        .filter(|key| !fresh.contains_key(*key))
        .cloned()
        .collect();

    let mut plan = ReconcilePlan {
        deletes,
        ..ReconcilePlan::default()
    };
    for (key, record) in fresh {
        match existing.get(&key) {
            Some(Some(current)) if current.same_content(&record) => plan.unchanged += 1,
            _ => plan.upserts.push(record),
        }
    }
    plan
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub deleted: usize,
    pub upserted: usize,
    pub unchanged: usize,
    pub batches: usize,
}

pub struct Reconciler {
    store: Arc<dyn DocumentStore>,
    batch_size: usize,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DocumentStore>, batch_size: usize) -> Self {
        let batch_size = batch_size.min(store.max_batch_ops()).max(1);
        Self { store, batch_size }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn load_existing(&self, date: NaiveDate) -> Result<ExistingRecords> {
        let docs = self
            .store
            .query_by_date(TEE_TIMES, date)
            .await
            .with_context(|| format!("loading persisted tee times for {date}"))?;
        let mut existing = ExistingRecords::new();
        for doc in docs {
            let record = match serde_json::from_value::<TeeTimeRecord>(doc.data) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(
                        key = %doc.key,
                        error = %err,
                        "unreadable tee time row; will be replaced"
                    );
                    None
                }
            };
            existing.insert(doc.key, record);
        }
        Ok(existing)
    }

    pub async fn plan(&self, date: NaiveDate, listings: &[Listing]) -> Result<ReconcilePlan> {
        let existing = self.load_existing(date).await?;
        let for_date: Vec<Listing> = listings.iter().filter(|l| l.date == date).cloned().collect();
        if for_date.len() != listings.len() {
            warn!(
                %date,
                dropped = listings.len() - for_date.len(),
                "listings for other dates ignored"
            );
        }
        Ok(plan_reconcile(&for_date, &existing))
    }

    pub async fn apply(
        &self,
        plan: &ReconcilePlan,
        crawled_at: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let ops = plan.write_ops(crawled_at)?;
        let batches = write_in_batches(self.store.as_ref(), ops, self.batch_size).await?;
        Ok(ReconcileOutcome {
            deleted: plan.deletes.len(),
            upserted: plan.upserts.len(),
            unchanged: plan.unchanged,
            batches,
        })
    }

    pub async fn reconcile(
        &self,
        date: NaiveDate,
        listings: &[Listing],
        crawled_at: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let plan = self.plan(date, listings).await?;
        if plan.is_empty() {
            debug!(%date, unchanged = plan.unchanged, "nothing to reconcile");
            return Ok(ReconcileOutcome {
                unchanged: plan.unchanged,
                ..ReconcileOutcome::default()
            });
        }
        let outcome = self.apply(&plan, crawled_at).await?;
        info!(
            %date,
            deleted = outcome.deleted,
            upserted = outcome.upserted,
            unchanged = outcome.unchanged,
            batches = outcome.batches,
            "tee times reconciled"
        );
        Ok(outcome)
    }
}

/// Writes `ops` in independent chunks. Chunks already written stay committed when a later
/// one fails. Returns the number of chunks written.
pub(crate) async fn write_in_batches(
    store: &dyn DocumentStore,
    ops: Vec<WriteOp>,
    batch_size: usize,
) -> Result<usize> {
    let batch_size = batch_size.max(1);
    let total = ops.len().div_ceil(batch_size);
    let mut ops = ops.into_iter().peekable();
    let mut written = 0;
    while ops.peek().is_some() {
        let chunk: Vec<WriteOp> = ops.by_ref().take(batch_size).collect();
        let size = chunk.len();
        store.batch_write(chunk).await.with_context(|| {
            format!(
                "batch {} of {total} ({size} ops) failed; {written} batches committed",
                written + 1
            )
        })?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fairway_core::{Source, TimeOfDay};
    use fairway_storage::{MemoryDocumentStore, StoreError, StoredDocument};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 11).unwrap()
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-12-10T21:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn listing(course: &str, hour: u32, price: u32) -> Listing {
        Listing::new(
            course,
            date(),
            TimeOfDay::new(hour, 0).unwrap(),
            price,
            Source::Golfpang,
            course,
        )
    }

    async fn seed(store: &MemoryDocumentStore, listings: &[Listing]) {
        let ops = listings
            .iter()
            .map(|l| {
                let record = TeeTimeRecord::from_listing(l);
                WriteOp::Set {
                    collection: TEE_TIMES.into(),
                    key: record.key(),
                    data: serde_json::to_value(&record).unwrap(),
                }
            })
            .collect();
        store.batch_write(ops).await.unwrap();
    }

    #[tokio::test]
    async fn crawl_versus_persisted_scenario() {
        let store = Arc::new(MemoryDocumentStore::default());
        seed(
            &store,
            &[
                listing("A", 8, 10_000),
                listing("B", 9, 15_000),
                listing("D", 11, 40_000),
            ],
        )
        .await;
        let reconciler = Reconciler::new(store.clone(), 400);

        let crawl = [listing("A", 8, 10_000), listing("B", 9, 20_000)];
        let plan = reconciler.plan(date(), &crawl).await.unwrap();
        assert_eq!(plan.deletes, vec![listing("D", 11, 0).persisted_key()]);
        assert_eq!(plan.upserts.len(), 1);
        assert_eq!(plan.upserts[0].club_name, "B");
        assert_eq!(plan.upserts[0].time, "09:00");
        assert_eq!(plan.upserts[0].price, 20_000);
        assert_eq!(plan.unchanged, 1);

        let outcome = reconciler.apply(&plan, now()).await.unwrap();
        assert_eq!((outcome.deleted, outcome.upserted), (1, 1));
        assert_eq!(store.len(TEE_TIMES).await, 2);

        let stored = store
            .get_by_key(TEE_TIMES, &plan.upserts[0].key())
            .await
            .unwrap()
            .unwrap();
        let stored: TeeTimeRecord = serde_json::from_value(stored).unwrap();
        assert_eq!(stored.price, 20_000);
        assert_eq!(stored.crawled_at, Some(now()));
    }

    #[tokio::test]
    async fn second_run_over_identical_input_writes_nothing() {
        let store = Arc::new(MemoryDocumentStore::default());
        let reconciler = Reconciler::new(store.clone(), 400);
        let crawl = [listing("A", 8, 10_000), listing("B", 9, 20_000), listing("C", 10, 30_000)];

        let first = reconciler.reconcile(date(), &crawl, now()).await.unwrap();
        assert_eq!(first.upserted, 3);
        let ops_after_first = store.committed_ops();

        let plan = reconciler.plan(date(), &crawl).await.unwrap();
        assert!(plan.is_empty());
        let second = reconciler.reconcile(date(), &crawl, now()).await.unwrap();
        assert_eq!(second.unchanged, 3);
        assert_eq!(store.committed_ops(), ops_after_first);
    }

    #[tokio::test]
    async fn one_changed_price_is_one_upsert() {
        let store = Arc::new(MemoryDocumentStore::default());
        let reconciler = Reconciler::new(store.clone(), 400);
        reconciler
            .reconcile(date(), &[listing("A", 8, 10_000), listing("B", 9, 20_000)], now())
            .await
            .unwrap();

        let plan = reconciler
            .plan(date(), &[listing("A", 8, 11_000), listing("B", 9, 20_000)])
            .await
            .unwrap();
        assert_eq!(plan.upserts.len(), 1);
        assert!(plan.deletes.is_empty());
    }

    #[tokio::test]
    async fn empty_crawl_clears_the_date() {
        let store = Arc::new(MemoryDocumentStore::default());
        seed(&store, &[listing("A", 8, 10_000)]).await;
        let outcome = Reconciler::new(store.clone(), 400)
            .reconcile(date(), &[], now())
            .await
            .unwrap();
        assert_eq!(outcome.deleted, 1);
        assert_eq!(store.len(TEE_TIMES).await, 0);
    }

    #[test]
    fn colliding_keys_keep_the_first_listing() {
        let mut cheap = listing("A", 8, 9_000);
        cheap.raw_label = "cheap".into();
        let plan = plan_reconcile(&[cheap, listing("A", 8, 12_000)], &ExistingRecords::new());
        assert_eq!(plan.upserts.len(), 1);
        assert_eq!(plan.upserts[0].price, 9_000);
    }

    #[test]
    fn unreadable_rows_are_replaced_or_deleted() {
        let mut existing = ExistingRecords::new();
        existing.insert(listing("A", 8, 0).persisted_key(), None);
        existing.insert(listing("Z", 8, 0).persisted_key(), None);
        let plan = plan_reconcile(&[listing("A", 8, 10_000)], &existing);
        assert_eq!(plan.upserts.len(), 1);
        assert_eq!(plan.deletes, vec![listing("Z", 8, 0).persisted_key()]);
    }

    /// Rejects every batch after the first `ok_batches`.
    struct FlakyStore {
        inner: MemoryDocumentStore,
        ok_batches: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        fn max_batch_ops(&self) -> usize {
            self.inner.max_batch_ops()
        }

        async fn query_by_equality(
            &self,
            collection: &str,
            field: &str,
            value: &Value,
        ) -> Result<Vec<StoredDocument>, StoreError> {
            self.inner.query_by_equality(collection, field, value).await
        }

        async fn query_field_from(
            &self,
            collection: &str,
            field: &str,
            from: &str,
        ) -> Result<Vec<StoredDocument>, StoreError> {
            self.inner.query_field_from(collection, field, from).await
        }

        async fn get_by_key(
            &self,
            collection: &str,
            key: &str,
        ) -> Result<Option<Value>, StoreError> {
            self.inner.get_by_key(collection, key).await
        }

        async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.ok_batches {
                return Err(StoreError::BatchTooLarge { size: ops.len(), limit: 0 });
            }
            self.inner.batch_write(ops).await
        }
    }

    #[tokio::test]
    async fn failing_batch_keeps_earlier_batches() {
        let store = Arc::new(FlakyStore {
            inner: MemoryDocumentStore::default(),
            ok_batches: 1,
            calls: AtomicUsize::new(0),
        });
        let reconciler = Reconciler::new(store.clone(), 2);
        let crawl: Vec<Listing> = (6..11).map(|h| listing("A", h, 10_000)).collect();

        let err = reconciler.reconcile(date(), &crawl, now()).await.unwrap_err();
        assert!(err.to_string().contains("batch 2 of 3"));
        assert_eq!(store.inner.len(TEE_TIMES).await, 2);
    }

    #[test]
    fn batch_size_respects_store_limit() {
        let store = Arc::new(MemoryDocumentStore::new(50));
        assert_eq!(Reconciler::new(store.clone(), 400).batch_size(), 50);
        assert_eq!(Reconciler::new(store, 0).batch_size(), 1);
    }
}
