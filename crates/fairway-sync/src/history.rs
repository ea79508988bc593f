//! Price history: hourly snapshots of upcoming tee times, rolled into one row per day.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use fairway_core::{
    weekday_index, DailyStat, HistorySnapshot, PriceComparison, PriceStats, TeeTimeRecord,
    DAILY_STATS, PRICE_HISTORY, TEE_TIMES,
};
use fairway_storage::{DocumentStore, StoredDocument, WriteOp};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::reconcile::write_in_batches;

pub const SNAPSHOT_TTL_DAYS: i64 = 7;
pub const COMPARISON_LAG_DAYS: i64 = 7;

/// Groups rows by `(club, date, hour)` into one snapshot each, stamped `now`.
pub fn build_snapshots(records: &[TeeTimeRecord], now: DateTime<Utc>) -> Vec<HistorySnapshot> {
    let mut groups: BTreeMap<(&str, NaiveDate, u8), Vec<u32>> = BTreeMap::new();
    for record in records.iter().filter(|r| r.price > 0) {
        groups
            .entry((record.club_name.as_str(), record.date, record.hour))
            .or_default()
            .push(record.price);
    }

    groups
        .into_iter()
        .filter_map(|((club, date, hour), prices)| {
            Some(HistorySnapshot {
                club_name: club.to_string(),
                date,
                hour,
                stats: PriceStats::from_prices(&prices)?,
                snapshot_at: now,
                expire_at: now + Duration::days(SNAPSHOT_TTL_DAYS),
                weekday: weekday_index(date),
            })
        })
        .collect()
}

/// Minimum of the snapshot minimums and mean of the snapshot averages per `(club, date, hour)`.
pub fn summarize_snapshots(snapshots: &[HistorySnapshot]) -> Vec<DailyStat> {
    let mut groups: BTreeMap<(&str, NaiveDate, u8), Vec<&PriceStats>> = BTreeMap::new();
    for snapshot in snapshots {
        groups
            .entry((snapshot.club_name.as_str(), snapshot.date, snapshot.hour))
            .or_default()
            .push(&snapshot.stats);
    }

    groups
        .into_iter()
        .filter_map(|((club, date, hour), stats)| {
            let min_price = stats.iter().map(|s| s.min).min()?;
            let avg_price = stats.iter().map(|s| s.avg).sum::<f64>() / stats.len() as f64;
            Some(DailyStat {
                club_name: club.to_string(),
                date,
                hour,
                min_price,
                avg_price,
                snapshot_count: stats.len() as u32,
            })
        })
        .collect()
}

/// Per-hour minimums of the current rows next to last week's, ordered by hour.
pub fn compare_minimums(
    current: &BTreeMap<u8, u32>,
    last_week: &BTreeMap<u8, u32>,
) -> Vec<PriceComparison> {
    current
        .iter()
        .map(|(hour, min)| PriceComparison {
            hour: *hour,
            current_min: *min,
            last_week_min: last_week.get(hour).copied(),
        })
        .collect()
}

fn keep_min(mins: &mut BTreeMap<u8, u32>, hour: u8, price: u32) {
    mins.entry(hour)
        .and_modify(|m| *m = (*m).min(price))
        .or_insert(price);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RollupOutcome {
    pub written: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub snapshot_at: DateTime<Utc>,
    pub snapshots: usize,
    pub rollup_date: NaiveDate,
    pub rollup: RollupOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeekOverWeek {
    pub club_name: String,
    pub date: NaiveDate,
    pub history_date: NaiveDate,
    /// True when last week's numbers came from raw snapshots instead of daily stats.
    pub from_snapshots: bool,
    pub hours: Vec<PriceComparison>,
}

pub struct HistoryArchiver {
    store: Arc<dyn DocumentStore>,
    batch_size: usize,
}

impl HistoryArchiver {
    pub fn new(store: Arc<dyn DocumentStore>, batch_size: usize) -> Self {
        let batch_size = batch_size.min(store.max_batch_ops()).max(1);
        Self { store, batch_size }
    }

    /// Stage 1: snapshot every persisted tee time dated `today` or later.
    pub async fn archive_snapshots(&self, today: NaiveDate, now: DateTime<Utc>) -> Result<usize> {
        let docs = self
            .store
            .query_date_from(TEE_TIMES, today)
            .await
            .context("loading upcoming tee times")?;
        let records: Vec<TeeTimeRecord> = decode_all(TEE_TIMES, docs);
        let snapshots = build_snapshots(&records, now);

        let ops = snapshots
            .iter()
            .map(|snapshot| {
                Ok(WriteOp::Set {
                    collection: PRICE_HISTORY.to_string(),
                    key: snapshot.key(),
                    data: serde_json::to_value(snapshot)?,
                })
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()
            .context("serializing snapshots")?;
        write_in_batches(self.store.as_ref(), ops, self.batch_size).await?;

        info!(
            tee_times = records.len(),
            snapshots = snapshots.len(),
            %now,
            "price snapshots archived"
        );
        Ok(snapshots.len())
    }

    /// Stage 2: fold every snapshot of `date` into one daily stat per club and hour.
    pub async fn roll_daily_stats(&self, date: NaiveDate) -> Result<RollupOutcome> {
        let docs = self
            .store
            .query_by_date(PRICE_HISTORY, date)
            .await
            .with_context(|| format!("loading snapshots for {date}"))?;
        let snapshots: Vec<HistorySnapshot> = decode_all(PRICE_HISTORY, docs);
        let stats = summarize_snapshots(&snapshots);

        let mut outcome = RollupOutcome::default();
        let mut ops = Vec::new();
        for stat in stats {
            let key = stat.key();
            let existing = self
                .store
                .get_by_key(DAILY_STATS, &key)
                .await
                .with_context(|| format!("reading daily stat {key}"))?
                .and_then(|value| serde_json::from_value::<DailyStat>(value).ok());
            if existing.is_some_and(|e| e.same_stats(&stat)) {
                outcome.unchanged += 1;
                continue;
            }
            ops.push(WriteOp::Set {
                collection: DAILY_STATS.to_string(),
                data: serde_json::to_value(&stat).context("serializing daily stat")?,
                key,
            });
        }
        outcome.written = ops.len();
        write_in_batches(self.store.as_ref(), ops, self.batch_size).await?;

        info!(
            %date,
            snapshots = snapshots.len(),
            written = outcome.written,
            unchanged = outcome.unchanged,
            "daily stats rolled up"
        );
        Ok(outcome)
    }

    /// Stage 1 for upcoming dates, then stage 2 for yesterday.
    pub async fn archive(&self, today: NaiveDate, now: DateTime<Utc>) -> Result<ArchiveSummary> {
        let snapshots = self.archive_snapshots(today, now).await?;
        let rollup_date = today - Duration::days(1);
        let rollup = self.roll_daily_stats(rollup_date).await?;
        Ok(ArchiveSummary {
            snapshot_at: now,
            snapshots,
            rollup_date,
            rollup,
        })
    }

    /// Current per-hour minimums for `club` on `date` against the same weekday last week.
    pub async fn compare_week_over_week(
        &self,
        club: &str,
        date: NaiveDate,
    ) -> Result<WeekOverWeek> {
        let history_date = date - Duration::days(COMPARISON_LAG_DAYS);

        let mut current = BTreeMap::new();
        let rows: Vec<TeeTimeRecord> = self.club_rows(TEE_TIMES, club, date).await?;
        for row in rows.iter().filter(|r| r.club_name == club && r.price > 0) {
            keep_min(&mut current, row.hour, row.price);
        }

        let mut last_week = BTreeMap::new();
        let stats: Vec<DailyStat> = self.club_rows(DAILY_STATS, club, history_date).await?;
        for stat in stats.iter().filter(|s| s.club_name == club) {
            keep_min(&mut last_week, stat.hour, stat.min_price);
        }

        let from_snapshots = last_week.is_empty();
        if from_snapshots {
            let snapshots: Vec<HistorySnapshot> =
                self.club_rows(PRICE_HISTORY, club, history_date).await?;
            for snapshot in snapshots.iter().filter(|s| s.club_name == club && s.stats.min > 0) {
                keep_min(&mut last_week, snapshot.hour, snapshot.stats.min);
            }
        }

        Ok(WeekOverWeek {
            club_name: club.to_string(),
            date,
            history_date,
            from_snapshots,
            hours: compare_minimums(&current, &last_week),
        })
    }

    async fn club_rows<T: DeserializeOwned>(
        &self,
        collection: &str,
        club: &str,
        date: NaiveDate,
    ) -> Result<Vec<T>> {
        let docs = self
            .store
            .query_by_date(collection, date)
            .await
            .with_context(|| format!("loading {collection} for {club} on {date}"))?;
        Ok(decode_all(collection, docs))
    }
}

fn decode_all<T: DeserializeOwned>(collection: &str, docs: Vec<StoredDocument>) -> Vec<T> {
    docs.into_iter()
        .filter_map(|doc| match serde_json::from_value(doc.data) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(collection, key = %doc.key, error = %err, "skipping unreadable document");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fairway_core::{PriceTrend, Source};
    use fairway_storage::MemoryDocumentStore;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 11).unwrap()
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 11, hour, minute, 0).unwrap()
    }

    fn record(club: &str, date: NaiveDate, hour: u8, price: u32) -> TeeTimeRecord {
        TeeTimeRecord {
            club_name: club.into(),
            date,
            time: format!("{hour:02}:10"),
            hour,
            price,
            source: Source::Golfpang,
            weekday: weekday_index(date),
            crawled_at: None,
        }
    }

    fn snapshot(
        club: &str,
        date: NaiveDate,
        hour: u8,
        min: u32,
        avg: f64,
        taken: DateTime<Utc>,
    ) -> HistorySnapshot {
        HistorySnapshot {
            club_name: club.into(),
            date,
            hour,
            stats: PriceStats { min, avg, count: 2 },
            snapshot_at: taken,
            expire_at: taken + Duration::days(SNAPSHOT_TTL_DAYS),
            weekday: weekday_index(date),
        }
    }

    async fn put<T: Serialize>(
        store: &MemoryDocumentStore,
        collection: &str,
        key: String,
        value: &T,
    ) {
        store
            .batch_write(vec![WriteOp::Set {
                collection: collection.into(),
                key,
                data: serde_json::to_value(value).unwrap(),
            }])
            .await
            .unwrap();
    }

    #[test]
    fn snapshots_group_by_club_date_and_hour() {
        let tomorrow = today().succ_opt().unwrap();
        let records = vec![
            record("X", today(), 8, 100_000),
            record("X", today(), 8, 80_000),
            record("X", today(), 9, 90_000),
            record("X", tomorrow, 8, 70_000),
            record("Y", today(), 8, 0),
        ];
        let snapshots = build_snapshots(&records, at(6, 0));
        assert_eq!(snapshots.len(), 3);

        let first = &snapshots[0];
        assert_eq!((first.date, first.hour), (today(), 8));
        assert_eq!(first.stats.min, 80_000);
        assert_eq!(first.stats.avg, 90_000.0);
        assert_eq!(first.stats.count, 2);
        assert_eq!(first.expire_at - first.snapshot_at, Duration::days(7));
    }

    #[test]
    fn daily_stat_takes_minimum_of_snapshot_minimums() {
        let snapshots = vec![
            snapshot("X", today(), 8, 5_000, 6_000.0, at(6, 0)),
            snapshot("X", today(), 8, 4_800, 5_000.0, at(12, 0)),
        ];
        let stats = summarize_snapshots(&snapshots);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].min_price, 4_800);
        assert!((stats[0].avg_price - 5_500.0).abs() < 1e-9);
        assert_eq!(stats[0].snapshot_count, 2);
    }

    #[tokio::test]
    async fn archive_writes_snapshots_then_rolls_yesterday() {
        let store = Arc::new(MemoryDocumentStore::default());
        let yesterday = today().pred_opt().unwrap();
        put(&store, TEE_TIMES, "t1".into(), &record("X", today(), 8, 90_000)).await;
        put(&store, TEE_TIMES, "t0".into(), &record("X", yesterday, 8, 10_000)).await;
        for snap in [
            snapshot("X", yesterday, 8, 5_000, 6_000.0, at(0, 0)),
            snapshot("X", yesterday, 8, 4_800, 5_000.0, at(1, 0)),
        ] {
            put(&store, PRICE_HISTORY, snap.key(), &snap).await;
        }

        let archiver = HistoryArchiver::new(store.clone(), 400);
        let summary = archiver.archive(today(), at(6, 30)).await.unwrap();
        assert_eq!(summary.snapshots, 1);
        assert_eq!(summary.rollup_date, yesterday);
        assert_eq!(summary.rollup.written, 1);

        let stat = store
            .get_by_key(DAILY_STATS, &fairway_core::daily_stat_key(yesterday, "X", 8))
            .await
            .unwrap()
            .unwrap();
        let stat: DailyStat = serde_json::from_value(stat).unwrap();
        assert_eq!(stat.min_price, 4_800);

        let again = archiver.roll_daily_stats(yesterday).await.unwrap();
        assert_eq!(again, RollupOutcome { written: 0, unchanged: 1 });
    }

    #[tokio::test]
    async fn week_over_week_prefers_daily_stats() {
        let store = Arc::new(MemoryDocumentStore::default());
        let last_week = today() - Duration::days(7);
        put(&store, TEE_TIMES, "a".into(), &record("X", today(), 8, 90_000)).await;
        put(&store, TEE_TIMES, "b".into(), &record("X", today(), 8, 85_000)).await;
        put(&store, TEE_TIMES, "c".into(), &record("X", today(), 10, 70_000)).await;
        put(&store, TEE_TIMES, "d".into(), &record("Y", today(), 8, 10_000)).await;
        let stat = DailyStat {
            club_name: "X".into(),
            date: last_week,
            hour: 8,
            min_price: 80_000,
            avg_price: 82_000.0,
            snapshot_count: 3,
        };
        put(&store, DAILY_STATS, stat.key(), &stat).await;

        let result = HistoryArchiver::new(store, 400)
            .compare_week_over_week("X", today())
            .await
            .unwrap();
        assert!(!result.from_snapshots);
        assert_eq!(result.history_date, last_week);
        assert_eq!(result.hours.len(), 2);
        assert_eq!(result.hours[0].current_min, 85_000);
        assert_eq!(result.hours[0].diff(), Some(5_000));
        assert_eq!(result.hours[0].trend(), PriceTrend::Up);
        assert_eq!(result.hours[1].last_week_min, None);
        assert_eq!(result.hours[1].trend(), PriceTrend::NoHistory);
    }

    #[tokio::test]
    async fn week_over_week_falls_back_to_snapshots() {
        let store = Arc::new(MemoryDocumentStore::default());
        let last_week = today() - Duration::days(7);
        put(&store, TEE_TIMES, "a".into(), &record("X", today(), 8, 90_000)).await;
        let snap = snapshot("X", last_week, 8, 95_000, 99_000.0, at(3, 0));
        put(&store, PRICE_HISTORY, snap.key(), &snap).await;

        let result = HistoryArchiver::new(store, 400)
            .compare_week_over_week("X", today())
            .await
            .unwrap();
        assert!(result.from_snapshots);
        assert_eq!(result.hours[0].last_week_min, Some(95_000));
        assert_eq!(result.hours[0].trend(), PriceTrend::Down);
    }

    #[tokio::test]
    async fn missing_history_is_not_an_error() {
        let store = Arc::new(MemoryDocumentStore::default());
        let result = HistoryArchiver::new(store, 400)
            .compare_week_over_week("X", today())
            .await
            .unwrap();
        assert!(result.hours.is_empty());
    }
}
