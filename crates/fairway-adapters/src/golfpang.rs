//! Golfpang: session-bootstrapped, sector-partitioned HTML booking table.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use fairway_core::{
    course_names_match, CourseDirectory, CourseDirectoryEntry, Listing, PriceBounds, Source,
};
use fairway_storage::{FetchRequest, HttpClientConfig, HttpFetcher};
use scraper::Html;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::normalize::{
    collapse_whitespace, find_price_token, is_maintenance_html, parse_price, parse_time_label,
    same_month_day, SkipCounts, SkipReason,
};
use crate::{
    element_text, parse_selector, select_first_text, AdapterContext, AdapterError, CrawlRequest,
    CrawlUnit, SourceAdapter, UnitOutcome,
};

pub const GOLFPANG_BASE: &str = "https://www.golfpang.com";
const LIST_PATH: &str = "/web/round/booking_list.do";
const NODE_PATH: &str = "/web/round/booking_node.do";
const TABLE_PATH: &str = "/web/round/booking_tblList.do";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Exhausted,
    NoNewMatches,
    PageCeiling,
    /// A later page failed; earlier pages are kept.
    FetchError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationLimits {
    /// Consecutive pages without a new listing before giving up.
    pub empty_page_threshold: u32,
    pub max_pages: u32,
    pub page_delay: Duration,
}

impl Default for PaginationLimits {
    fn default() -> Self {
        Self {
            empty_page_threshold: 3,
            max_pages: 50,
            page_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GolfpangSettings {
    pub base_url: String,
    pub sectors: Vec<u32>,
    pub max_workers: usize,
    pub limits: PaginationLimits,
    pub course_page_limit: u32,
    pub price_bounds: PriceBounds,
    pub http: HttpClientConfig,
}

impl Default for GolfpangSettings {
    fn default() -> Self {
        Self {
            base_url: GOLFPANG_BASE.to_string(),
            sectors: vec![5, 4, 8],
            max_workers: 3,
            limits: PaginationLimits::default(),
            course_page_limit: 10,
            price_bounds: PriceBounds::default(),
            http: HttpClientConfig {
                cookie_store: true,
                accept_invalid_certs: true,
                user_agent: Some(DEFAULT_USER_AGENT.to_string()),
                ..HttpClientConfig::default()
            },
        }
    }
}

/// How a table row's club label is turned into a canonical course name.
#[derive(Debug, Clone)]
pub enum ClubResolver<'a> {
    /// Normalized-name match against directory codes.
    Directory(Vec<&'a CourseDirectoryEntry>),
    /// Server-side filtered table; every row belongs to this course.
    Fixed(&'a str),
}

impl ClubResolver<'_> {
    fn resolve(&self, label: &str) -> Option<&str> {
        match self {
            ClubResolver::Directory(targets) => targets
                .iter()
                .find(|entry| {
                    entry
                        .golfpang_code
                        .as_deref()
                        .is_some_and(|code| course_names_match(label, code))
                })
                .map(|entry| entry.name.as_str()),
            ClubResolver::Fixed(name) => Some(*name),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    /// Rows present in the table, matched or not.
    pub raw_rows: usize,
    pub listings: Vec<Listing>,
    pub skips: SkipCounts,
}

/// Parses one `booking_tblList.do` fragment.
pub fn parse_booking_page(
    html: &str,
    date: NaiveDate,
    resolver: &ClubResolver<'_>,
    bounds: PriceBounds,
) -> Result<ParsedPage, AdapterError> {
    // Bare `<tr>` fragments are dropped by the HTML parser unless they sit inside a table.
    let document = if html.contains("<table") {
        Html::parse_document(html)
    } else {
        Html::parse_document(&format!("<table>{html}</table>"))
    };
    let row_sel = parse_selector(r#"tr[id^="tr_"]"#)?;
    let cell_sel = parse_selector("td")?;
    let price_sel = parse_selector("span.price")?;

    let mut page = ParsedPage::default();
    for row in document.select(&row_sel) {
        page.raw_rows += 1;
        let cells: Vec<_> = row.select(&cell_sel).collect();
        if cells.len() < 5 {
            continue;
        }

        let date_text = element_text(cells[1]);
        let time_text = element_text(cells[2]);
        let club_text = collapse_whitespace(&element_text(cells[4]));

        if !same_month_day(date, &date_text) {
            page.skips.record(SkipReason::DateMismatch);
            continue;
        }

        let Some(course) = resolver.resolve(&club_text) else {
            page.skips.record(SkipReason::UnmatchedClub);
            continue;
        };

        let row_text = element_text(row);
        let price_text = select_first_text(row, &price_sel)
            .or_else(|| find_price_token(&row_text).map(str::to_string))
            .unwrap_or_default();
        let Some(price) = parse_price(&price_text, bounds) else {
            page.skips.record(SkipReason::NoPrice);
            continue;
        };

        let Some(time_of_day) = parse_time_label(&time_text) else {
            page.skips.record(SkipReason::BadTime);
            continue;
        };

        page.listings.push(Listing::new(
            course,
            date,
            time_of_day,
            price,
            Source::Golfpang,
            club_text,
        ));
    }
    Ok(page)
}

/// Something that can hand out booking table pages by number.
#[async_trait]
pub trait PageSource: Send {
    async fn fetch_page(&mut self, page: u32) -> Result<String, AdapterError>;
}

/// Drives `source` from page 1 until a stop condition. A failure on page 1 fails the
/// partition; a failure on a later page stops it with what was collected so far.
pub async fn paginate<S, F>(
    source: &mut S,
    limits: PaginationLimits,
    mut parse: F,
) -> Result<UnitOutcome, AdapterError>
where
    S: PageSource,
    F: FnMut(&str) -> Result<ParsedPage, AdapterError> + Send,
{
    let mut outcome = UnitOutcome::default();
    let mut seen = HashSet::new();
    let mut barren_pages = 0u32;
    let mut page = 1u32;

    let stop = loop {
        let html = match source.fetch_page(page).await {
            Ok(html) => html,
            Err(err) if page == 1 => return Err(err),
            Err(err) => {
                warn!(
                    page,
                    kept = outcome.listings.len(),
                    error = %err,
                    "page fetch failed; keeping earlier pages"
                );
                break StopReason::FetchError;
            }
        };
        let parsed = parse(&html)?;
        outcome.pages = page;
        outcome.skips.merge(&parsed.skips);

        if parsed.raw_rows == 0 {
            break StopReason::Exhausted;
        }

        let mut added = 0usize;
        for listing in parsed.listings {
            if seen.insert(listing.dedup_key()) {
                outcome.listings.push(listing);
                added += 1;
            } else {
                outcome.skips.record(SkipReason::Duplicate);
            }
        }
        debug!(page, rows = parsed.raw_rows, added, "page parsed");

        barren_pages = if added == 0 { barren_pages + 1 } else { 0 };
        if barren_pages >= limits.empty_page_threshold {
            break StopReason::NoNewMatches;
        }
        if page >= limits.max_pages {
            break StopReason::PageCeiling;
        }

        page += 1;
        tokio::time::sleep(limits.page_delay).await;
    };

    outcome.stop = Some(stop);
    Ok(outcome)
}

/// One cookie-carrying connection to Golfpang, scoped to a date and sector.
pub struct GolfpangSession {
    fetcher: HttpFetcher,
    base_url: String,
    run_id: Uuid,
    date: NaiveDate,
    sector: u32,
}

impl GolfpangSession {
    pub fn open(
        settings: &GolfpangSettings,
        run_id: Uuid,
        date: NaiveDate,
        sector: u32,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            fetcher: HttpFetcher::new(settings.http.clone())?,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            run_id,
            date,
            sector,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn html_headers(&self) -> [(&'static str, String); 4] {
        [
            ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".into()),
            ("Accept-Language", "ko,en;q=0.9".into()),
            ("Origin", self.base_url.clone()),
            ("Referer", self.url(LIST_PATH)),
        ]
    }

    fn ajax_headers(&self) -> [(&'static str, String); 6] {
        [
            ("Accept", "text/html, */*; q=0.01".into()),
            ("Accept-Language", "ko,en;q=0.9".into()),
            ("X-Requested-With", "XMLHttpRequest".into()),
            ("Origin", self.base_url.clone()),
            ("Referer", self.url(LIST_PATH)),
            ("x-customer-check", "gp-post-key-2019".into()),
        ]
    }

    /// Primes session cookies. Tolerant: a failed handshake still lets the crawl proceed.
    pub async fn bootstrap(&self) -> bool {
        let list = FetchRequest::get(self.url(LIST_PATH))
            .with_headers(self.html_headers().iter().map(|(k, v)| (*k, v.as_str())));
        let list_ok = match self.fetcher.fetch(self.run_id, "golfpang", &list).await {
            Ok(_) => true,
            Err(err) => {
                debug!(sector = self.sector, error = %err, "bootstrap list request failed");
                false
            }
        };

        let date = self.date.format("%Y-%m-%d").to_string();
        let sector = self.sector.to_string();
        let payloads: [Vec<(&str, String)>; 4] = [
            vec![("Depth", "2".into()), ("GID", sector.clone()), ("SUB_GID", String::new())],
            vec![("roundDay", date.clone())],
            vec![("rd_date", date.clone())],
            vec![("rd_date", date.clone()), ("sector", sector.clone())],
        ];

        let mut node_ok = false;
        for payload in payloads {
            let request = FetchRequest::post_form(self.url(NODE_PATH), payload)
                .with_headers(self.ajax_headers().iter().map(|(k, v)| (*k, v.as_str())));
            match self.fetcher.fetch(self.run_id, "golfpang", &request).await {
                Ok(resp) if !resp.text().contains("점검") => {
                    node_ok = true;
                    break;
                }
                Ok(_) => debug!(sector = self.sector, "bootstrap node answered with maintenance"),
                Err(err) => {
                    debug!(sector = self.sector, error = %err, "bootstrap node request failed")
                }
            }
        }

        if !node_ok {
            info!(
                sector = self.sector,
                list_ok,
                "node handshake failed; continuing with list cookies"
            );
        }
        list_ok || node_ok
    }

    async fn post_table_once(&self, form: &[(String, String)]) -> Result<String, AdapterError> {
        let request = FetchRequest::post_form(self.url(TABLE_PATH), form.iter().cloned())
            .with_headers(self.ajax_headers().iter().map(|(k, v)| (*k, v.as_str())));
        let resp = self.fetcher.fetch(self.run_id, "golfpang", &request).await?;
        Ok(resp.text())
    }

    /// Posts a table form. Maintenance pages and 5xx trigger one re-bootstrap and retry.
    pub async fn post_table(&self, form: &[(String, String)]) -> Result<String, AdapterError> {
        let reason = match self.post_table_once(form).await {
            Ok(body) if !is_maintenance_html(&body) => return Ok(body),
            Ok(_) => "maintenance page",
            Err(AdapterError::Fetch(err)) if err.is_server_error() => "server error",
            Err(err) => return Err(err),
        };

        info!(sector = self.sector, reason, "re-bootstrapping session before retry");
        self.bootstrap().await;
        let body = self.post_table_once(form).await?;
        if is_maintenance_html(&body) {
            return Err(AdapterError::Maintenance(format!("sector {}", self.sector)));
        }
        Ok(body)
    }
}

fn table_form(
    date: NaiveDate,
    sector: u32,
    club_id: Option<&str>,
    page: u32,
) -> Vec<(String, String)> {
    let club = club_id.unwrap_or_default().to_string();
    vec![
        ("pageNum".into(), page.to_string()),
        ("rd_date".into(), date.format("%Y-%m-%d").to_string()),
        ("sector".into(), sector.to_string()),
        ("clubname".into(), club.clone()),
        ("bkOrder".into(), String::new()),
        ("idx".into(), String::new()),
        ("cust_nick".into(), String::new()),
        ("sector2".into(), String::new()),
        ("sector3".into(), club),
        ("cdOrder".into(), String::new()),
    ]
}

struct TablePages<'a> {
    session: &'a GolfpangSession,
    club_id: Option<&'a str>,
}

#[async_trait]
impl<'a> PageSource for TablePages<'a> {
    async fn fetch_page(&mut self, page: u32) -> Result<String, AdapterError> {
        let form = table_form(self.session.date, self.session.sector, self.club_id, page);
        self.session.post_table(&form).await
    }
}

pub struct GolfpangAdapter {
    directory: Arc<CourseDirectory>,
    settings: GolfpangSettings,
}

impl GolfpangAdapter {
    pub fn new(directory: Arc<CourseDirectory>, settings: GolfpangSettings) -> Self {
        Self { directory, settings }
    }

    pub fn settings(&self) -> &GolfpangSettings {
        &self.settings
    }

    /// Requested sectors restricted to the configured set; empty or absent means all.
    pub fn resolve_sectors(&self, requested: Option<&[u32]>) -> Vec<u32> {
        match requested {
            Some(sectors) if !sectors.is_empty() => sectors
                .iter()
                .copied()
                .filter(|s| self.settings.sectors.contains(s))
                .collect(),
            _ => self.settings.sectors.clone(),
        }
    }

    async fn crawl_sector(
        &self,
        ctx: &AdapterContext,
        request: &CrawlRequest,
        sector: u32,
    ) -> Result<UnitOutcome, AdapterError> {
        let targets = self.directory.golfpang_targets(sector, &request.favorites);
        if targets.is_empty() {
            debug!(sector, "no golfpang targets for sector");
            return Ok(UnitOutcome::default());
        }

        let session = GolfpangSession::open(&self.settings, ctx.run_id, request.date, sector)?;
        session.bootstrap().await;
        info!(sector, date = %request.date, targets = targets.len(), "sector crawl started");

        let resolver = ClubResolver::Directory(targets);
        let bounds = self.settings.price_bounds;
        let date = request.date;
        let mut pages = TablePages {
            session: &session,
            club_id: None,
        };
        let outcome = paginate(&mut pages, self.settings.limits, |html| {
            parse_booking_page(html, date, &resolver, bounds)
        })
        .await?;

        info!(
            sector,
            count = outcome.listings.len(),
            pages = outcome.pages,
            stop = ?outcome.stop,
            skips = %outcome.skips,
            "sector crawl finished"
        );
        Ok(outcome)
    }

    /// Crawls a single club by its Golfpang id, trusting the server-side filter.
    pub async fn crawl_course(
        &self,
        ctx: &AdapterContext,
        date: NaiveDate,
        golfpang_id: &str,
        sector: u32,
    ) -> Result<UnitOutcome, AdapterError> {
        let entry = self
            .directory
            .find_by_golfpang_id(golfpang_id)
            .ok_or_else(|| AdapterError::Message(format!("unknown golfpang id {golfpang_id}")))?;

        let session = GolfpangSession::open(&self.settings, ctx.run_id, date, sector)?;
        session.bootstrap().await;

        let limits = PaginationLimits {
            empty_page_threshold: u32::MAX,
            max_pages: self.settings.course_page_limit,
            ..self.settings.limits
        };
        let resolver = ClubResolver::Fixed(&entry.name);
        let bounds = self.settings.price_bounds;
        let mut pages = TablePages {
            session: &session,
            club_id: Some(golfpang_id),
        };
        let outcome = paginate(&mut pages, limits, |html| {
            parse_booking_page(html, date, &resolver, bounds)
        })
        .await?;

        info!(
            course = %entry.name,
            count = outcome.listings.len(),
            pages = outcome.pages,
            "course crawl finished"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl SourceAdapter for GolfpangAdapter {
    fn source(&self) -> Source {
        Source::Golfpang
    }

    fn plan(&self, request: &CrawlRequest) -> Vec<CrawlUnit> {
        self.resolve_sectors(request.sectors.as_deref())
            .into_iter()
            .map(CrawlUnit::Sector)
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
        match unit {
            CrawlUnit::Sector(sector) => self.crawl_sector(ctx, request, *sector).await,
            other => {
                warn!(unit = %other, "golfpang cannot crawl this unit");
                Err(AdapterError::Message(format!("golfpang cannot crawl {other}")))
            }
        }
    }
}
