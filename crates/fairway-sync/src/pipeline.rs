use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use fairway_adapters::{load_course_directory, CrawlRequest, GolfpangAdapter};
use fairway_core::CourseDirectory;
use fairway_storage::{DocumentStore, JsonFileStore};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheSettings, TeeTimeCache};
use crate::config::{SourceRegistry, SyncConfig};
use crate::crawl::{CrawlOrchestrator, Crawler};
use crate::history::{ArchiveSummary, HistoryArchiver};
use crate::reconcile::{ReconcileOutcome, Reconciler};

/// Everything built from one `SyncConfig`: course directory, crawler and store.
pub struct SyncServices {
    pub config: SyncConfig,
    pub directory: Arc<CourseDirectory>,
    pub registry: SourceRegistry,
    pub crawler: Arc<CrawlOrchestrator>,
    pub store: Arc<dyn DocumentStore>,
}

impl SyncServices {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let directory = load_course_directory(&config.courses_path)?;
        let registry = SourceRegistry::load_or_default(&config.sources_path).await?;
        let runtimes = registry.build_runtimes(&config, directory.clone())?;
        if runtimes.is_empty() {
            warn!(path = %config.sources_path.display(), "no enabled sources");
        }
        info!(
            courses = directory.len(),
            sources = runtimes.len(),
            store = %config.store_dir.display(),
            "sync services ready"
        );
        let store: Arc<dyn DocumentStore> = Arc::new(JsonFileStore::new(config.store_dir.clone()));
        Ok(Self {
            directory,
            registry,
            crawler: Arc::new(CrawlOrchestrator::new(runtimes)),
            store,
            config,
        })
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(SyncConfig::from_env()).await
    }

    pub fn cache(&self) -> Arc<TeeTimeCache> {
        let crawler: Arc<dyn Crawler> = self.crawler.clone();
        Arc::new(TeeTimeCache::new(
            crawler,
            self.crawler.breaker(),
            CacheSettings::from(&self.config),
        ))
    }

    pub fn golfpang(&self) -> Option<GolfpangAdapter> {
        self.registry.golfpang_adapter(&self.config, self.directory.clone())
    }

    pub fn pipeline(&self) -> IngestPipeline {
        IngestPipeline::new(self.config.clone(), self.crawler.clone(), self.store.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestDateResult {
    pub date: NaiveDate,
    pub listings: usize,
    pub outcome: Option<ReconcileOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dates: Vec<IngestDateResult>,
}

impl IngestRunSummary {
    pub fn listings(&self) -> usize {
        self.dates.iter().map(|d| d.listings).sum()
    }

    pub fn upserted(&self) -> usize {
        self.dates.iter().filter_map(|d| d.outcome).map(|o| o.upserted).sum()
    }

    pub fn deleted(&self) -> usize {
        self.dates.iter().filter_map(|d| d.outcome).map(|o| o.deleted).sum()
    }

    pub fn failed_dates(&self) -> usize {
        self.dates.iter().filter(|d| d.error.is_some()).count()
    }
}

pub struct IngestPipeline {
    config: SyncConfig,
    crawler: Arc<dyn Crawler>,
    reconciler: Reconciler,
    archiver: HistoryArchiver,
}

impl IngestPipeline {
    pub fn new(
        config: SyncConfig,
        crawler: Arc<dyn Crawler>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        let reconciler = Reconciler::new(store.clone(), config.batch_size);
        let archiver = HistoryArchiver::new(store, config.batch_size);
        Self {
            config,
            crawler,
            reconciler,
            archiver,
        }
    }

    pub fn archiver(&self) -> &HistoryArchiver {
        &self.archiver
    }

    pub async fn run_once(&self) -> IngestRunSummary {
        self.run_once_from(Local::now().date_naive()).await
    }

    /// Crawls and reconciles `[today, today + ingest_days)`, one date at a time.
    pub async fn run_once_from(&self, today: NaiveDate) -> IngestRunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, %today, days = self.config.ingest_days, "ingest started");

        let mut dates = Vec::new();
        for date in today.iter_days().take(self.config.ingest_days as usize) {
            dates.push(self.ingest_date(date).await);
        }

        let summary = IngestRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dates,
        };
        info!(
            %run_id,
            listings = summary.listings(),
            upserted = summary.upserted(),
            deleted = summary.deleted(),
            failed_dates = summary.failed_dates(),
            "ingest finished"
        );
        summary
    }

    async fn ingest_date(&self, date: NaiveDate) -> IngestDateResult {
        let report = self.crawler.crawl(&CrawlRequest::new(date)).await;
        report.log_summary();
        let listings = report.listings.len();

        // An empty crawl clears the date, unless it is empty because the sources failed.
        let degraded = listings == 0
            && report
                .sources
                .iter()
                .any(|s| s.is_total_failure() || s.skipped_by_breaker);
        if degraded {
            warn!(%date, "crawl failed; persisted rows left untouched");
            return IngestDateResult {
                date,
                listings,
                outcome: None,
                error: Some("crawl failed for every unit of a source".to_string()),
            };
        }

        match self.reconciler.reconcile(date, &report.listings, Utc::now()).await {
            Ok(outcome) => IngestDateResult {
                date,
                listings,
                outcome: Some(outcome),
                error: None,
            },
            Err(err) => {
                error!(%date, error = ?err, "reconcile failed");
                IngestDateResult {
                    date,
                    listings,
                    outcome: None,
                    error: Some(format!("{err:#}")),
                }
            }
        }
    }

    pub async fn archive_once(&self) -> Result<ArchiveSummary> {
        let now = Utc::now();
        self.archive_at(Local::now().date_naive(), now).await
    }

    pub async fn archive_at(&self, today: NaiveDate, now: DateTime<Utc>) -> Result<ArchiveSummary> {
        let summary = self.archiver.archive(today, now).await?;
        info!(
            snapshots = summary.snapshots,
            rollup_date = %summary.rollup_date,
            written = summary.rollup.written,
            "archive finished"
        );
        Ok(summary)
    }
}

/// Cron jobs for ingest and archive, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(pipeline: Arc<IngestPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(pipeline).await.map(Some)
}

pub async fn build_scheduler(pipeline: Arc<IngestPipeline>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let ingest = Arc::clone(&pipeline);
    let cron = &pipeline.config.ingest_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&ingest);
        Box::pin(async move {
            let summary = pipeline.run_once().await;
            info!(failed_dates = summary.failed_dates(), "scheduled ingest done");
        })
    })
    .with_context(|| format!("creating ingest job for cron {cron}"))?;
    sched.add(job).await.context("adding ingest job")?;

    let archive = Arc::clone(&pipeline);
    let cron = &pipeline.config.archive_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&archive);
        Box::pin(async move {
            if let Err(err) = pipeline.archive_once().await {
                error!(error = ?err, "scheduled archive failed");
            }
        })
    })
    .with_context(|| format!("creating archive job for cron {cron}"))?;
    sched.add(job).await.context("adding archive job")?;

    Ok(sched)
}

pub async fn run_ingest_once_from_env() -> Result<IngestRunSummary> {
    let services = SyncServices::from_env().await?;
    Ok(services.pipeline().run_once().await)
}
