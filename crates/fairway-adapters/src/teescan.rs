//! Teescan: one JSON request per course and date.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use fairway_core::{CourseDirectory, Listing, PriceBounds, Source, TimeOfDay};
use fairway_storage::{FetchRequest, HttpClientConfig, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::normalize::{parse_price, parse_time_label, SkipCounts, SkipReason};
use crate::{AdapterContext, AdapterError, CrawlRequest, CrawlUnit, SourceAdapter, UnitOutcome};

pub const TEESCAN_API: &str = "https://foapi.teescanner.com/v1/booking/getTeeTimeListbyGolfclub";

#[derive(Debug, Clone)]
pub struct TeescanSettings {
    pub api_url: String,
    pub max_workers: usize,
    pub price_bounds: PriceBounds,
    pub http: HttpClientConfig,
}

impl Default for TeescanSettings {
    fn default() -> Self {
        Self {
            api_url: TEESCAN_API.to_string(),
            max_workers: 5,
            price_bounds: PriceBounds::default(),
            http: HttpClientConfig {
                read_timeout: Duration::from_secs(3),
                user_agent: Some("Mozilla/5.0".to_string()),
                ..HttpClientConfig::default()
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct TeeTimeListResponse {
    #[serde(default)]
    data: Option<TeeTimeListData>,
}

#[derive(Debug, Deserialize)]
struct TeeTimeListData {
    #[serde(default, rename = "teeTimeList")]
    tee_time_list: Vec<TeeTimeRow>,
}

#[derive(Debug, Deserialize)]
struct TeeTimeRow {
    #[serde(default)]
    price: Option<JsonValue>,
    #[serde(default)]
    teetime_time: Option<String>,
}

fn row_price(value: Option<&JsonValue>, bounds: PriceBounds) -> Option<u32> {
    match value? {
        JsonValue::Number(n) => {
            let price = n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))?;
            bounds.contains(price).then(|| price as u32)
        }
        JsonValue::String(s) => parse_price(s, bounds),
        _ => None,
    }
}

/// `HH:MM` as sent by the API, or a bare `HHMM`/`HH`.
fn row_time(text: &str) -> Option<TimeOfDay> {
    if let Some(time) = parse_time_label(text) {
        return Some(time);
    }
    let digits = text.trim();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match digits.len() {
        1 | 2 => TimeOfDay::new(digits.parse().ok()?, 0),
        4 => TimeOfDay::new(digits[..2].parse().ok()?, digits[2..].parse().ok()?),
        _ => None,
    }
}

/// Parses a `getTeeTimeListbyGolfclub` body for one course.
pub fn parse_tee_time_list(
    body: &str,
    course: &str,
    date: NaiveDate,
    bounds: PriceBounds,
) -> Result<(Vec<Listing>, SkipCounts), AdapterError> {
    let response: TeeTimeListResponse =
        serde_json::from_str(body).map_err(|e| AdapterError::Malformed(e.to_string()))?;
    let rows = response.data.map(|d| d.tee_time_list).unwrap_or_default();

    let mut listings = Vec::with_capacity(rows.len());
    let mut skips = SkipCounts::default();
    for row in rows {
        let Some(price) = row_price(row.price.as_ref(), bounds) else {
            skips.record(SkipReason::NoPrice);
            continue;
        };
        let Some(time_of_day) = row.teetime_time.as_deref().and_then(row_time) else {
            skips.record(SkipReason::BadTime);
            continue;
        };
        listings.push(Listing::new(course, date, time_of_day, price, Source::Teescan, course));
    }
    Ok((listings, skips))
}

pub struct TeescanAdapter {
    directory: Arc<CourseDirectory>,
    settings: TeescanSettings,
    fetcher: HttpFetcher,
}

impl TeescanAdapter {
    pub fn new(directory: Arc<CourseDirectory>, settings: TeescanSettings) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(settings.http.clone())?;
        Ok(Self {
            directory,
            settings,
            fetcher,
        })
    }

    fn url(&self, seq: &str, date: NaiveDate) -> String {
        format!(
            "{}?golfclub_seq={seq}&roundDay={}&orderType=",
            self.settings.api_url,
            date.format("%Y-%m-%d")
        )
    }
}

#[async_trait]
impl SourceAdapter for TeescanAdapter {
    fn source(&self) -> Source {
        Source::Teescan
    }

    fn plan(&self, request: &CrawlRequest) -> Vec<CrawlUnit> {
        self.directory
            .teescan_targets(&request.favorites)
            .into_iter()
            .filter_map(|entry| {
                Some(CrawlUnit::Course {
                    name: entry.name.clone(),
                    seq: entry.teescan_seq.clone()?,
                })
            })
            .collect()
    }

    fn concurrency(&self, units: usize) -> usize {
        units.min(self.settings.max_workers).max(1)
    }

    async fn crawl_unit(
        &self,
        ctx: &AdapterContext,
        request: &CrawlRequest,
        unit: &CrawlUnit,
    ) -> Result<UnitOutcome, AdapterError> {
        let CrawlUnit::Course { name, seq } = unit else {
            return Err(AdapterError::Message(format!("teescan cannot crawl {unit}")));
        };

        let fetch = FetchRequest::get(self.url(seq, request.date));
        let resp = self.fetcher.fetch(ctx.run_id, "teescan", &fetch).await?;
        let (listings, skips) =
            parse_tee_time_list(&resp.text(), name, request.date, self.settings.price_bounds)?;
        debug!(course = %name, count = listings.len(), skips = %skips, "teescan course parsed");

        Ok(UnitOutcome {
            listings,
            skips,
            pages: 1,
            stop: None,
        })
    }
}
