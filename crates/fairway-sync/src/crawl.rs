//! Fans a crawl request out over every enabled source and merges the results.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use fairway_adapters::{
    AdapterContext, AdapterError, CrawlRequest, CrawlUnit, SkipCounts, SourceAdapter, UnitOutcome,
};
use fairway_core::{dedup_listings, sort_listings, Listing, Source};
use fairway_storage::CircuitBreaker;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

#[async_trait]
pub trait Crawler: Send + Sync {
    async fn crawl(&self, request: &CrawlRequest) -> CrawlReport;
}

/// An adapter plus the breaker guarding it, if any.
#[derive(Clone)]
pub struct SourceRuntime {
    adapter: Arc<dyn SourceAdapter>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl SourceRuntime {
    pub fn new(adapter: Arc<dyn SourceAdapter>, breaker: Option<Arc<CircuitBreaker>>) -> Self {
        Self { adapter, breaker }
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source: Source,
    pub units: usize,
    pub failed_units: usize,
    pub listings: usize,
    pub duplicates: usize,
    pub skips: SkipCounts,
    pub skipped_by_breaker: bool,
    pub errors: Vec<String>,
}

impl SourceReport {
    fn new(source: Source) -> Self {
        Self {
            source,
            units: 0,
            failed_units: 0,
            listings: 0,
            duplicates: 0,
            skips: SkipCounts::default(),
            skipped_by_breaker: false,
            errors: Vec::new(),
        }
    }

    /// Every planned unit failed.
    pub fn is_total_failure(&self) -> bool {
        self.units > 0 && self.failed_units == self.units
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlReport {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub listings: Vec<Listing>,
    pub sources: Vec<SourceReport>,
}

impl CrawlReport {
    pub fn source(&self, source: Source) -> Option<&SourceReport> {
        self.sources.iter().find(|r| r.source == source)
    }

    pub fn listings_per_club(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for listing in &self.listings {
            *counts.entry(listing.course.as_str()).or_default() += 1;
        }
        counts
    }

    pub fn log_summary(&self) {
        info!(
            run_id = %self.run_id,
            date = %self.date,
            total = self.listings.len(),
            "crawl summary"
        );
        for report in &self.sources {
            info!(
                date = %self.date,
                source = %report.source,
                units = report.units,
                failed_units = report.failed_units,
                listings = report.listings,
                duplicates = report.duplicates,
                skips = %report.skips,
                skipped_by_breaker = report.skipped_by_breaker,
                "source summary"
            );
        }
        for (club, count) in self.listings_per_club() {
            info!(date = %self.date, club, count, "club summary");
        }
    }
}

struct UnitsOutcome {
    listings: Vec<Listing>,
    skips: SkipCounts,
    failed: usize,
    errors: Vec<String>,
}

pub struct CrawlOrchestrator {
    runtimes: Vec<SourceRuntime>,
}

impl CrawlOrchestrator {
    pub fn new(runtimes: Vec<SourceRuntime>) -> Self {
        Self { runtimes }
    }

    /// Breaker of the first guarded source.
    pub fn breaker(&self) -> Option<Arc<CircuitBreaker>> {
        self.runtimes.iter().find_map(|r| r.breaker.clone())
    }
}

#[async_trait]
impl Crawler for CrawlOrchestrator {
    async fn crawl(&self, request: &CrawlRequest) -> CrawlReport {
        let ctx = AdapterContext::new();
        let results = join_all(
            self.runtimes
                .iter()
                .map(|runtime| crawl_source(&ctx, runtime, request)),
        )
        .await;

        let mut listings = Vec::new();
        let mut sources = Vec::with_capacity(results.len());
        for (source_listings, report) in results {
            listings.extend(source_listings);
            sources.push(report);
        }
        sort_listings(&mut listings);

        CrawlReport {
            run_id: ctx.run_id,
            date: request.date,
            listings,
            sources,
        }
    }
}

async fn crawl_source(
    ctx: &AdapterContext,
    runtime: &SourceRuntime,
    request: &CrawlRequest,
) -> (Vec<Listing>, SourceReport) {
    let adapter = runtime.adapter.as_ref();
    let source = adapter.source();
    let mut report = SourceReport::new(source);
    let units = adapter.plan(request);
    report.units = units.len();
    if units.is_empty() {
        return (Vec::new(), report);
    }

    // A source counts as failed for the breaker only when nothing succeeded.
    let units = units.as_slice();
    let work = move || async move {
        let outcome = run_units(ctx, adapter, request, units).await;
        if outcome.failed == units.len() {
            Err(outcome)
        } else {
            Ok(outcome)
        }
    };
    let outcome = match &runtime.breaker {
        Some(breaker) => match breaker.call(work).await {
            Some(Ok(outcome)) | Some(Err(outcome)) => outcome,
            None => {
                info!(
                    source = %source,
                    date = %request.date,
                    open_until = ?breaker.state().open_until,
                    "circuit open; source skipped"
                );
                report.skipped_by_breaker = true;
                return (Vec::new(), report);
            }
        },
        None => match work().await {
            Ok(outcome) | Err(outcome) => outcome,
        },
    };

    let mut listings = outcome.listings;
    sort_listings(&mut listings);
    report.duplicates = dedup_listings(&mut listings);
    report.listings = listings.len();
    report.failed_units = outcome.failed;
    report.skips = outcome.skips;
    report.errors = outcome.errors;
    (listings, report)
}

async fn run_units(
    ctx: &AdapterContext,
    adapter: &dyn SourceAdapter,
    request: &CrawlRequest,
    units: &[CrawlUnit],
) -> UnitsOutcome {
    let width = adapter.concurrency(units.len());
    let results: Vec<(CrawlUnit, Result<UnitOutcome, AdapterError>)> =
        stream::iter(units.iter().cloned())
            .map(move |unit| async move {
                let result = adapter.crawl_unit(ctx, request, &unit).await;
                (unit, result)
            })
            .buffer_unordered(width)
            .collect()
            .await;

    let mut outcome = UnitsOutcome {
        listings: Vec::new(),
        skips: SkipCounts::default(),
        failed: 0,
        errors: Vec::new(),
    };
    for (unit, result) in results {
        match result {
            Ok(unit_outcome) => {
                outcome.listings.extend(unit_outcome.listings);
                outcome.skips.merge(&unit_outcome.skips);
            }
            Err(err) => {
                warn!(source = %adapter.source(), unit = %unit, error = %err, "crawl unit failed");
                outcome.failed += 1;
                outcome.errors.push(format!("{unit}: {err}"));
            }
        }
    }
    outcome
}
