use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use fairway_adapters::{
    GolfpangAdapter, GolfpangSettings, PaginationLimits, SourceAdapter, TeescanAdapter,
    TeescanSettings,
};
use fairway_core::{CourseDirectory, Source};
use fairway_storage::{CircuitBreaker, CircuitBreakerConfig, HttpClientConfig};
use serde::Deserialize;
use tokio::fs;
use tracing::warn;

use crate::crawl::SourceRuntime;

pub const MIN_REFRESH_INTERVAL_SECS: u64 = 60;
/// Longest breaker cool-down accepted from the environment: one week.
pub const MAX_BREAKER_COOL_DOWN_MINUTES: i64 = 7 * 24 * 60;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_dir: PathBuf,
    pub courses_path: PathBuf,
    pub sources_path: PathBuf,
    pub max_days: u32,
    pub refresh_interval_secs: u64,
    pub ingest_days: u32,
    pub batch_size: usize,
    pub breaker_threshold: u32,
    pub breaker_cool_down_minutes: i64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub user_agent: Option<String>,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
    pub archive_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| var(key).and_then(|v| v.trim().parse::<u64>().ok());
        let parsed_u32 = |key: &str| parsed(key).map(|v| u32::try_from(v).unwrap_or(u32::MAX));
        Self {
            store_dir: var("FAIRWAY_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/store")),
            courses_path: var("FAIRWAY_COURSES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/golf_clubs.json")),
            sources_path: var("FAIRWAY_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sources.yaml")),
            max_days: parsed_u32("MAX_DAYS").unwrap_or(18).max(1),
            refresh_interval_secs: parsed("REFRESH_INTERVAL_SEC")
                .unwrap_or(3600)
                .max(MIN_REFRESH_INTERVAL_SECS),
            ingest_days: parsed_u32("INGEST_DAYS").unwrap_or(14).max(1),
            batch_size: parsed("FAIRWAY_BATCH_SIZE")
                .map_or(400, |v| usize::try_from(v).unwrap_or(usize::MAX))
                .max(1),
            breaker_threshold: parsed_u32("GOLFPANG_CB_THRESH").unwrap_or(5).max(1),
            breaker_cool_down_minutes: parsed("GOLFPANG_CB_COOL_MIN").map_or(5, |v| {
                i64::try_from(v).unwrap_or(i64::MAX).min(MAX_BREAKER_COOL_DOWN_MINUTES)
            }),
            connect_timeout_secs: parsed("FAIRWAY_CONNECT_TIMEOUT_SECS").unwrap_or(5),
            read_timeout_secs: parsed("FAIRWAY_READ_TIMEOUT_SECS").unwrap_or(20),
            user_agent: var("FAIRWAY_USER_AGENT").filter(|v| !v.trim().is_empty()),
            scheduler_enabled: var("FAIRWAY_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ingest_cron: var("INGEST_CRON").unwrap_or_else(|| "0 0 */6 * * *".to_string()),
            archive_cron: var("ARCHIVE_CRON").unwrap_or_else(|| "0 30 0 * * *".to_string()),
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            threshold: self.breaker_threshold,
            cool_down: ChronoDuration::minutes(
                self.breaker_cool_down_minutes.clamp(0, MAX_BREAKER_COOL_DOWN_MINUTES),
            ),
        }
    }

    fn http_config(&self, read_timeout_secs: Option<u64>) -> HttpClientConfig {
        HttpClientConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(read_timeout_secs.unwrap_or(self.read_timeout_secs)),
            user_agent: self.user_agent.clone(),
            ..HttpClientConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source: Source,
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub sectors: Vec<u32>,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub empty_page_threshold: Option<u32>,
    #[serde(default)]
    pub page_delay_ms: Option<u64>,
    #[serde(default)]
    pub course_page_limit: Option<u32>,
    #[serde(default)]
    pub read_timeout_secs: Option<u64>,
    /// Guard the source with a circuit breaker.
    #[serde(default)]
    pub breaker: bool,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        let golfpang = SourceConfig {
            source: Source::Golfpang,
            enabled: true,
            base_url: None,
            sectors: vec![5, 4, 8],
            max_workers: None,
            max_pages: None,
            empty_page_threshold: None,
            page_delay_ms: None,
            course_page_limit: None,
            read_timeout_secs: None,
            breaker: true,
        };
        let teescan = SourceConfig {
            source: Source::Teescan,
            sectors: Vec::new(),
            read_timeout_secs: Some(3),
            breaker: false,
            ..golfpang.clone()
        };
        Self {
            sources: vec![golfpang, teescan],
        }
    }
}

impl SourceRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Falls back to the built-in registry when `path` does not exist.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if fs::try_exists(path).await.unwrap_or(false) {
            return Self::load(path).await;
        }
        warn!(path = %path.display(), "source registry not found; using built-in defaults");
        Ok(Self::default())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Instantiates one runtime per enabled source, each with its own breaker when configured.
    pub fn build_runtimes(
        &self,
        config: &SyncConfig,
        directory: Arc<CourseDirectory>,
    ) -> Result<Vec<SourceRuntime>> {
        let mut runtimes = Vec::new();
        for source in self.enabled() {
            let adapter: Arc<dyn SourceAdapter> = match source.source {
                Source::Golfpang => Arc::new(GolfpangAdapter::new(
                    directory.clone(),
                    golfpang_settings(source, config),
                )),
                Source::Teescan => Arc::new(
                    TeescanAdapter::new(directory.clone(), teescan_settings(source, config))
                        .context("building teescan adapter")?,
                ),
            };
            let breaker = source.breaker.then(|| {
                Arc::new(CircuitBreaker::new(source.source.as_str(), config.breaker_config()))
            });
            runtimes.push(SourceRuntime::new(adapter, breaker));
        }
        Ok(runtimes)
    }

    /// A standalone Golfpang client for single-course crawls, if the source is enabled.
    pub fn golfpang_adapter(
        &self,
        config: &SyncConfig,
        directory: Arc<CourseDirectory>,
    ) -> Option<GolfpangAdapter> {
        self.enabled()
            .find(|s| s.source == Source::Golfpang)
            .map(|source| GolfpangAdapter::new(directory, golfpang_settings(source, config)))
    }
}

fn golfpang_settings(source: &SourceConfig, config: &SyncConfig) -> GolfpangSettings {
    let defaults = GolfpangSettings::default();
    let limits = PaginationLimits {
        empty_page_threshold: source
            .empty_page_threshold
            .unwrap_or(defaults.limits.empty_page_threshold),
        max_pages: source.max_pages.unwrap_or(defaults.limits.max_pages),
        page_delay: source
            .page_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.limits.page_delay),
    };
    let mut http = config.http_config(source.read_timeout_secs);
    http.cookie_store = true;
    http.accept_invalid_certs = defaults.http.accept_invalid_certs;
    if http.user_agent.is_none() {
        http.user_agent = defaults.http.user_agent.clone();
    }

    GolfpangSettings {
        base_url: source.base_url.clone().unwrap_or(defaults.base_url),
        sectors: if source.sectors.is_empty() {
            defaults.sectors
        } else {
            source.sectors.clone()
        },
        max_workers: source.max_workers.unwrap_or(defaults.max_workers),
        limits,
        course_page_limit: source.course_page_limit.unwrap_or(defaults.course_page_limit),
        price_bounds: defaults.price_bounds,
        http,
    }
}

fn teescan_settings(source: &SourceConfig, config: &SyncConfig) -> TeescanSettings {
    let defaults = TeescanSettings::default();
    let mut http = config.http_config(source.read_timeout_secs);
    if http.user_agent.is_none() {
        http.user_agent = defaults.http.user_agent.clone();
    }
    TeescanSettings {
        api_url: source.base_url.clone().unwrap_or(defaults.api_url),
        max_workers: source.max_workers.unwrap_or(defaults.max_workers),
        price_bounds: defaults.price_bounds,
        http,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> SyncConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = SyncConfig::default();
        assert_eq!(config.max_days, 18);
        assert_eq!(config.refresh_interval_secs, 3600);
        assert_eq!(config.ingest_days, 14);
        assert_eq!(config.batch_size, 400);
        assert_eq!(config.breaker_threshold, 5);
        assert_eq!(config.breaker_config().cool_down, ChronoDuration::minutes(5));
        assert!(!config.scheduler_enabled);
        assert_eq!(config.ingest_cron, "0 0 */6 * * *");
    }

    #[test]
    fn values_are_clamped() {
        let config = config_from(&[
            ("MAX_DAYS", "0"),
            ("REFRESH_INTERVAL_SEC", "5"),
            ("FAIRWAY_BATCH_SIZE", "0"),
            ("FAIRWAY_SCHEDULER_ENABLED", "true"),
            ("FAIRWAY_USER_AGENT", "  "),
        ]);
        assert_eq!(config.max_days, 1);
        assert_eq!(config.refresh_interval_secs, 60);
        assert_eq!(config.batch_size, 1);
        assert!(config.scheduler_enabled);
        assert!(config.user_agent.is_none());
    }

    #[test]
    fn garbage_values_fall_back_to_defaults() {
        let config = config_from(&[("MAX_DAYS", "many"), ("GOLFPANG_CB_THRESH", "-3")]);
        assert_eq!(config.max_days, 18);
        assert_eq!(config.breaker_threshold, 5);
    }

    #[test]
    fn oversized_values_saturate_instead_of_wrapping() {
        let config = config_from(&[
            ("MAX_DAYS", "4294967296"),
            ("GOLFPANG_CB_THRESH", "4294967297"),
            ("GOLFPANG_CB_COOL_MIN", "200000000000"),
        ]);
        assert_eq!(config.max_days, u32::MAX);
        assert_eq!(config.breaker_threshold, u32::MAX);
        assert_eq!(config.breaker_cool_down_minutes, MAX_BREAKER_COOL_DOWN_MINUTES);
        assert_eq!(config.breaker_config().cool_down, ChronoDuration::weeks(1));

        let huge = config_from(&[("GOLFPANG_CB_COOL_MIN", "18446744073709551615")]);
        assert_eq!(huge.breaker_cool_down_minutes, MAX_BREAKER_COOL_DOWN_MINUTES);
    }

    #[test]
    fn registry_parses_per_source_settings() {
        let registry = SourceRegistry::parse(
            r#"
sources:
  - source: golfpang
    enabled: true
    sectors: [5, 4]
    max_pages: 20
    page_delay_ms: 10
    breaker: true
  - source: teescan
    enabled: false
    max_workers: 2
"#,
        )
        .unwrap();
        assert_eq!(registry.enabled().count(), 1);

        let config = SyncConfig::default();
        let settings = golfpang_settings(&registry.sources[0], &config);
        assert_eq!(settings.sectors, vec![5, 4]);
        assert_eq!(settings.limits.max_pages, 20);
        assert_eq!(settings.limits.empty_page_threshold, 3);
        assert_eq!(settings.limits.page_delay, Duration::from_millis(10));
        assert!(settings.http.cookie_store);
        assert!(settings.http.user_agent.is_some());

        let runtimes = registry
            .build_runtimes(&config, Arc::new(CourseDirectory::default()))
            .unwrap();
        assert_eq!(runtimes.len(), 1);
        assert!(runtimes[0].breaker().is_some());

        let adapter = registry
            .golfpang_adapter(&config, Arc::new(CourseDirectory::default()))
            .unwrap();
        assert_eq!(adapter.settings().limits.max_pages, 20);
    }

    #[test]
    fn built_in_registry_guards_only_golfpang() {
        let registry = SourceRegistry::default();
        let guarded: Vec<_> = registry
            .sources
            .iter()
            .filter(|s| s.breaker)
            .map(|s| s.source)
            .collect();
        assert_eq!(guarded, vec![Source::Golfpang]);
    }

    #[tokio::test]
    async fn missing_registry_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::load_or_default(&tmp.path().join("sources.yaml"))
            .await
            .unwrap();
        assert_eq!(registry.sources.len(), 2);
    }
}
