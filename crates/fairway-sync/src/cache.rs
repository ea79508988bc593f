//! In-memory per-date snapshots kept warm by a background refresh loop.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, Local, NaiveDate, Utc};
use fairway_adapters::CrawlRequest;
use fairway_core::{sort_listings, FavoriteFilter, Listing};
use fairway_storage::CircuitBreaker;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{SyncConfig, MIN_REFRESH_INTERVAL_SECS};
use crate::crawl::{CrawlReport, Crawler};

pub const READ_LOCK_TIMEOUT: Duration = Duration::from_secs(3);
pub const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub max_days: u32,
    pub refresh_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_days: 18,
            refresh_interval_secs: 3600,
        }
    }
}

impl From<&SyncConfig> for CacheSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_days: config.max_days,
            refresh_interval_secs: config.refresh_interval_secs,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ConfigUpdate {
    pub max_days: Option<u32>,
    pub refresh_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    pub failures: u32,
    pub open_until: Option<DateTime<Utc>>,
    pub threshold: u32,
    pub cool_down_minutes: i64,
}

impl BreakerStatus {
    fn of(breaker: &CircuitBreaker) -> Self {
        let state = breaker.state();
        let config = breaker.config();
        Self {
            failures: state.consecutive_failures,
            open_until: state.open_until,
            threshold: config.threshold,
            cool_down_minutes: config.cool_down.num_minutes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeConfig {
    pub max_days: u32,
    pub refresh_interval_secs: u64,
    pub breaker: Option<BreakerStatus>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub dates: usize,
    pub listings: usize,
    pub evicted: usize,
}

enum Lookup {
    Hit(Arc<Vec<Listing>>),
    Miss,
    Unavailable,
}

pub struct TeeTimeCache {
    crawler: Arc<dyn Crawler>,
    breaker: Option<Arc<CircuitBreaker>>,
    snapshots: Mutex<HashMap<NaiveDate, Arc<Vec<Listing>>>>,
    settings: std::sync::Mutex<CacheSettings>,
    wake: Notify,
    pass: Mutex<()>,
    loop_started: AtomicBool,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl TeeTimeCache {
    pub fn new(
        crawler: Arc<dyn Crawler>,
        breaker: Option<Arc<CircuitBreaker>>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            crawler,
            breaker,
            snapshots: Mutex::new(HashMap::new()),
            settings: std::sync::Mutex::new(clamp(settings)),
            wake: Notify::new(),
            pass: Mutex::new(()),
            loop_started: AtomicBool::new(false),
            read_timeout: READ_LOCK_TIMEOUT,
            write_timeout: WRITE_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    pub fn settings(&self) -> CacheSettings {
        *self.settings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Listings for `date` restricted to `favorites`. A missing or empty snapshot is
    /// crawled synchronously first; a busy cache yields an empty result.
    pub async fn get_cached(&self, date: NaiveDate, favorites: &FavoriteFilter) -> Vec<Listing> {
        let snapshot = match self.lookup(date).await {
            Lookup::Hit(listings) => listings,
            Lookup::Unavailable => return Vec::new(),
            Lookup::Miss => {
                debug!(%date, "cache miss; refreshing on demand");
                self.refresh_date(date).await;
                match self.lookup(date).await {
                    Lookup::Hit(listings) => listings,
                    Lookup::Miss | Lookup::Unavailable => return Vec::new(),
                }
            }
        };
        snapshot
            .iter()
            .filter(|l| favorites.matches(&l.course))
            .cloned()
            .collect()
    }

    /// Every listing between `start` and `end` inclusive (either order), optionally
    /// limited to an hour-bucket range, globally sorted.
    pub async fn get_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        hours: Option<RangeInclusive<u8>>,
        favorites: &FavoriteFilter,
    ) -> Vec<Listing> {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        let mut listings = Vec::new();
        for date in start.iter_days().take_while(|d| *d <= end) {
            let day = self.get_cached(date, favorites).await;
            listings.extend(
                day.into_iter()
                    .filter(|l| hours.as_ref().map_or(true, |h| h.contains(&l.hour_bucket))),
            );
        }
        sort_listings(&mut listings);
        listings
    }

    /// Crawls one date across all courses and replaces its snapshot.
    pub async fn refresh_date(&self, date: NaiveDate) -> CrawlReport {
        let report = self.crawler.crawl(&CrawlRequest::new(date)).await;
        report.log_summary();

        let degraded = report.listings.is_empty()
            && report
                .sources
                .iter()
                .any(|s| s.is_total_failure() || s.skipped_by_breaker);

        match timeout(self.write_timeout, self.snapshots.lock()).await {
            Ok(mut snapshots) => {
                if degraded && snapshots.contains_key(&date) {
                    warn!(
                        %date,
                        "crawl produced nothing while sources were failing; keeping previous snapshot"
                    );
                } else {
                    snapshots.insert(date, Arc::new(report.listings.clone()));
                }
            }
            Err(_) => warn!(%date, "cache busy; snapshot write skipped"),
        }
        report
    }

    /// One sequential pass over `[today, today + max_days)`, then eviction of dates
    /// outside that window. Concurrent passes wait for each other.
    pub async fn full_refresh_from(&self, today: NaiveDate) -> PassSummary {
        let _pass = self.pass.lock().await;
        let max_days = self.settings().max_days;
        info!(%today, max_days, "refresh pass started");

        let mut summary = PassSummary::default();
        for date in today.iter_days().take(max_days as usize) {
            let report = self.refresh_date(date).await;
            summary.dates += 1;
            summary.listings += report.listings.len();
        }
        summary.evicted = self.evict_outside(today, max_days).await;

        info!(
            dates = summary.dates,
            listings = summary.listings,
            evicted = summary.evicted,
            "refresh pass finished"
        );
        summary
    }

    pub async fn full_refresh(&self) -> PassSummary {
        self.full_refresh_from(Local::now().date_naive()).await
    }

    /// Refresh passes forever, sleeping `refresh_interval_secs` or until woken in between.
    pub async fn run(&self) {
        loop {
            self.full_refresh().await;
            let interval = Duration::from_secs(self.settings().refresh_interval_secs);
            tokio::select! {
                _ = sleep(interval) => {}
                _ = self.wake.notified() => debug!("refresh loop woken early"),
            }
        }
    }

    /// Spawns the refresh loop unless it is already running.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.loop_started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let cache = Arc::clone(self);
        Some(tokio::spawn(async move { cache.run().await }))
    }

    /// `None` wakes the loop for a full pass; a date is refreshed in the background.
    /// Returns false when a full pass was asked for but no loop is running to take it.
    pub fn request_refresh(self: &Arc<Self>, date: Option<NaiveDate>) -> bool {
        match date {
            None if !self.loop_started.load(Ordering::SeqCst) => {
                warn!("full refresh requested but the refresh loop is not running");
                false
            }
            None => {
                self.wake.notify_one();
                true
            }
            Some(date) => {
                let cache = Arc::clone(self);
                tokio::spawn(async move {
                    cache.refresh_date(date).await;
                });
                true
            }
        }
    }

    pub fn config(&self) -> RuntimeConfig {
        let settings = self.settings();
        RuntimeConfig {
            max_days: settings.max_days,
            refresh_interval_secs: settings.refresh_interval_secs,
            breaker: self.breaker_status(),
        }
    }

    pub fn set_config(&self, update: ConfigUpdate) -> RuntimeConfig {
        let interval_changed = {
            let mut settings = self
                .settings
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let before = settings.refresh_interval_secs;
            let next = clamp(CacheSettings {
                max_days: update.max_days.unwrap_or(settings.max_days),
                refresh_interval_secs: update
                    .refresh_interval_secs
                    .unwrap_or(settings.refresh_interval_secs),
            });
            *settings = next;
            next.refresh_interval_secs != before
        };
        if interval_changed {
            self.wake.notify_one();
        }
        let config = self.config();
        info!(
            max_days = config.max_days,
            refresh_interval_secs = config.refresh_interval_secs,
            "cache settings updated"
        );
        config
    }

    pub fn breaker_status(&self) -> Option<BreakerStatus> {
        self.breaker.as_deref().map(BreakerStatus::of)
    }

    pub async fn cached_dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self.snapshots.lock().await.keys().copied().collect();
        dates.sort();
        dates
    }

    async fn lookup(&self, date: NaiveDate) -> Lookup {
        match timeout(self.read_timeout, self.snapshots.lock()).await {
            Ok(snapshots) => match snapshots.get(&date) {
                Some(listings) if !listings.is_empty() => Lookup::Hit(Arc::clone(listings)),
                _ => Lookup::Miss,
            },
            Err(_) => {
                warn!(%date, "cache temporarily unavailable");
                Lookup::Unavailable
            }
        }
    }

    async fn evict_outside(&self, today: NaiveDate, max_days: u32) -> usize {
        // No upper bound when the window runs past the calendar's end.
        let end = today.checked_add_days(Days::new(u64::from(max_days)));
        match timeout(self.write_timeout, self.snapshots.lock()).await {
            Ok(mut snapshots) => {
                let before = snapshots.len();
                snapshots.retain(|date, _| *date >= today && end.map_or(true, |end| *date < end));
                before - snapshots.len()
            }
            Err(_) => {
                warn!("cache busy; eviction skipped");
                0
            }
        }
    }
}

fn clamp(settings: CacheSettings) -> CacheSettings {
    CacheSettings {
        max_days: settings.max_days.max(1),
        refresh_interval_secs: settings.refresh_interval_secs.max(MIN_REFRESH_INTERVAL_SECS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::SourceReport;
    use async_trait::async_trait;
    use fairway_core::{Source, TimeOfDay};
    use fairway_storage::CircuitBreakerConfig;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, d).unwrap()
    }

    /// Two listings per date; an empty result for dates in `barren`.
    struct FakeCrawler {
        calls: AtomicUsize,
        barren: Vec<NaiveDate>,
    }

    impl FakeCrawler {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                barren: Vec::new(),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Crawler for FakeCrawler {
        async fn crawl(&self, request: &CrawlRequest) -> CrawlReport {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let listings = if self.barren.contains(&request.date) {
                Vec::new()
            } else {
                vec![
                    Listing::new(
                        "한원CC",
                        request.date,
                        TimeOfDay::new(7, 30).unwrap(),
                        90_000,
                        Source::Golfpang,
                        "한원",
                    ),
                    Listing::new(
                        "세일CC",
                        request.date,
                        TimeOfDay::new(13, 0).unwrap(),
                        70_000,
                        Source::Teescan,
                        "세일",
                    ),
                ]
            };
            CrawlReport {
                run_id: Uuid::new_v4(),
                date: request.date,
                listings,
                sources: Vec::<SourceReport>::new(),
            }
        }
    }

    fn cache(crawler: Arc<FakeCrawler>) -> Arc<TeeTimeCache> {
        Arc::new(TeeTimeCache::new(crawler, None, CacheSettings::default()))
    }

    #[tokio::test]
    async fn miss_refreshes_once_then_serves_from_memory() {
        let crawler = Arc::new(FakeCrawler::new());
        let cache = cache(crawler.clone());

        let all = cache.get_cached(day(11), &FavoriteFilter::all()).await;
        assert_eq!(all.len(), 2);
        let favourite = cache.get_cached(day(11), &FavoriteFilter::new(["한원"])).await;
        assert_eq!(favourite.len(), 1);
        assert_eq!(favourite[0].course, "한원CC");
        assert_eq!(crawler.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn held_lock_yields_empty_result_after_timeout() {
        let crawler = Arc::new(FakeCrawler::new());
        let cache = cache(crawler.clone());
        cache.refresh_date(day(11)).await;

        let guard = cache.snapshots.lock().await;
        let started = tokio::time::Instant::now();
        let listings = cache.get_cached(day(11), &FavoriteFilter::all()).await;
        let waited = started.elapsed();
        drop(guard);

        assert!(listings.is_empty());
        assert!(waited >= READ_LOCK_TIMEOUT);
        assert!(waited < READ_LOCK_TIMEOUT + Duration::from_secs(1));
        assert_eq!(crawler.calls(), 1);
    }

    #[tokio::test]
    async fn range_swaps_bounds_and_filters_hours() {
        let crawler = Arc::new(FakeCrawler::new());
        let cache = cache(crawler.clone());

        let listings = cache
            .get_range(day(12), day(10), Some(6..=9), &FavoriteFilter::all())
            .await;
        assert_eq!(listings.len(), 3);
        assert!(listings.iter().all(|l| l.hour_bucket == 7));
        assert_eq!(
            listings.iter().map(|l| l.date).collect::<Vec<_>>(),
            vec![day(10), day(11), day(12)]
        );
        assert_eq!(crawler.calls(), 3);
    }

    #[tokio::test]
    async fn pass_covers_window_and_evicts_stale_dates() {
        let crawler = Arc::new(FakeCrawler::new());
        let cache = cache(crawler.clone());
        cache.set_config(ConfigUpdate {
            max_days: Some(3),
            refresh_interval_secs: None,
        });
        cache.refresh_date(day(1)).await;

        let summary = cache.full_refresh_from(day(10)).await;
        assert_eq!(summary.dates, 3);
        assert_eq!(summary.listings, 6);
        assert_eq!(summary.evicted, 1);
        assert_eq!(cache.cached_dates().await, vec![day(10), day(11), day(12)]);
    }

    #[tokio::test]
    async fn empty_dates_are_recrawled_on_read() {
        let crawler = Arc::new(FakeCrawler {
            calls: AtomicUsize::new(0),
            barren: vec![day(11)],
        });
        let cache = cache(crawler.clone());
        assert!(cache.get_cached(day(11), &FavoriteFilter::all()).await.is_empty());
        assert!(cache.get_cached(day(11), &FavoriteFilter::all()).await.is_empty());
        assert_eq!(crawler.calls(), 2);
    }

    #[tokio::test]
    async fn set_config_clamps_values() {
        let cache = cache(Arc::new(FakeCrawler::new()));
        let config = cache.set_config(ConfigUpdate {
            max_days: Some(0),
            refresh_interval_secs: Some(10),
        });
        assert_eq!(config.max_days, 1);
        assert_eq!(config.refresh_interval_secs, 60);
        assert!(config.breaker.is_none());
    }

    #[tokio::test]
    async fn breaker_status_reflects_state() {
        let breaker = Arc::new(CircuitBreaker::new("golfpang", CircuitBreakerConfig::default()));
        breaker.record_failure_at(Utc::now());
        let cache = TeeTimeCache::new(
            Arc::new(FakeCrawler::new()),
            Some(breaker),
            CacheSettings::default(),
        );

        let status = cache.config().breaker.unwrap();
        assert_eq!(status.failures, 1);
        assert_eq!(status.threshold, 5);
        assert_eq!(status.cool_down_minutes, 5);
        assert!(status.open_until.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wake_signal_starts_the_next_pass_early() {
        let crawler = Arc::new(FakeCrawler::new());
        let cache = cache(crawler.clone());
        cache.set_config(ConfigUpdate {
            max_days: Some(1),
            refresh_interval_secs: None,
        });

        let handle = cache.start().unwrap();
        assert!(cache.start().is_none());
        while crawler.calls() < 1 {
            tokio::task::yield_now().await;
        }

        assert!(cache.request_refresh(None));
        while crawler.calls() < 2 {
            tokio::task::yield_now().await;
        }
        handle.abort();
        assert_eq!(crawler.calls(), 2);
    }

    #[tokio::test]
    async fn full_refresh_request_without_loop_is_reported() {
        let crawler = Arc::new(FakeCrawler::new());
        let cache = cache(crawler.clone());
        assert!(!cache.request_refresh(None));
        tokio::task::yield_now().await;
        assert_eq!(crawler.calls(), 0);
    }

    #[tokio::test]
    async fn window_past_calendar_end_only_evicts_the_past() {
        let cache = cache(Arc::new(FakeCrawler::new()));
        cache.refresh_date(day(10)).await;
        cache.refresh_date(day(11)).await;
        let config = cache.set_config(ConfigUpdate {
            max_days: Some(u32::MAX),
            refresh_interval_secs: None,
        });
        assert_eq!(config.max_days, u32::MAX);

        assert_eq!(cache.evict_outside(day(11), u32::MAX).await, 1);
        assert_eq!(cache.cached_dates().await, vec![day(11)]);
    }
}
