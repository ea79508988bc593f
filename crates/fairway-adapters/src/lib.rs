//! Source adapter contracts plus the Golfpang and Teescan clients.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fairway_core::{CourseDirectory, CourseDirectoryEntry, FavoriteFilter, Listing, Source};
use fairway_storage::FetchError;
use scraper::{ElementRef, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod golfpang;
pub mod normalize;
pub mod teescan;

pub use golfpang::{GolfpangAdapter, GolfpangSettings, PaginationLimits, StopReason};
pub use normalize::{SkipCounts, SkipReason};
pub use teescan::{TeescanAdapter, TeescanSettings};

pub const CRATE_NAME: &str = "fairway-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

/// One crawl invocation. `sectors: None` means every configured sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlRequest {
    pub date: NaiveDate,
    pub favorites: FavoriteFilter,
    pub sectors: Option<Vec<u32>>,
}

impl CrawlRequest {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            favorites: FavoriteFilter::all(),
            sectors: None,
        }
    }

    pub fn with_favorites(mut self, favorites: FavoriteFilter) -> Self {
        self.favorites = favorites;
        self
    }

    pub fn with_sectors(mut self, sectors: Vec<u32>) -> Self {
        self.sectors = Some(sectors);
        self
    }
}

/// Smallest independently crawlable piece of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlUnit {
    Sector(u32),
    Course { name: String, seq: String },
}

impl std::fmt::Display for CrawlUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrawlUnit::Sector(sector) => write!(f, "sector={sector}"),
            CrawlUnit::Course { name, seq } => write!(f, "course={name}({seq})"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitOutcome {
    pub listings: Vec<Listing>,
    pub skips: SkipCounts,
    pub pages: u32,
    pub stop: Option<StopReason>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("upstream maintenance persisted after re-bootstrap ({0})")]
    Maintenance(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    /// Breaks a request into units that can be crawled independently.
    fn plan(&self, request: &CrawlRequest) -> Vec<CrawlUnit>;

    /// Worker pool width for `units` planned units.
    fn concurrency(&self, units: usize) -> usize;

    async fn crawl_unit(
        &self,
        ctx: &AdapterContext,
        request: &CrawlRequest,
        unit: &CrawlUnit,
    ) -> Result<UnitOutcome, AdapterError>;
}

/// Loads the static course directory (a JSON array of entries).
pub fn load_course_directory(path: impl AsRef<Path>) -> Result<Arc<CourseDirectory>> {
    let entries: Vec<CourseDirectoryEntry> = read_json_file(path)?;
    Ok(Arc::new(CourseDirectory::new(entries)))
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

/// Text nodes trimmed and joined by single spaces.
fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    #[test]
    fn sample_course_directory_loads() {
        let directory =
            load_course_directory(workspace_root().join("data/golf_clubs.json")).unwrap();
        assert!(!directory.is_empty());
        assert!(directory.entries().iter().any(|e| e.golfpang_code.is_some()));
        assert!(directory.entries().iter().any(|e| e.teescan_seq.is_some()));
    }

    #[test]
    fn missing_directory_reports_path() {
        let err = load_course_directory("/nonexistent/golf_clubs.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/golf_clubs.json"));
    }

    #[test]
    fn crawl_request_defaults_to_all_sectors() {
        let date = NaiveDate::from_ymd_opt(2025, 12, 11).unwrap();
        let req = CrawlRequest::new(date);
        assert!(req.sectors.is_none());
        assert!(req.favorites.is_empty());
        assert_eq!(req.with_sectors(vec![5]).sectors, Some(vec![5]));
    }
}
