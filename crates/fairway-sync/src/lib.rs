//! Crawl orchestration, the tee-time cache, reconciliation into the document store,
//! price history and the scheduled jobs that tie them together.

pub mod cache;
pub mod config;
pub mod crawl;
pub mod history;
pub mod pipeline;
pub mod reconcile;

pub use cache::{
    BreakerStatus, CacheSettings, ConfigUpdate, PassSummary, RuntimeConfig, TeeTimeCache,
};
pub use config::{SourceConfig, SourceRegistry, SyncConfig};
pub use crawl::{CrawlOrchestrator, CrawlReport, Crawler, SourceReport, SourceRuntime};
pub use history::{ArchiveSummary, HistoryArchiver, RollupOutcome, WeekOverWeek};
pub use pipeline::{
    build_scheduler, maybe_build_scheduler, run_ingest_once_from_env, IngestDateResult,
    IngestPipeline, IngestRunSummary, SyncServices,
};
pub use reconcile::{plan_reconcile, ReconcileOutcome, ReconcilePlan, Reconciler};

pub const CRATE_NAME: &str = "fairway-sync";
