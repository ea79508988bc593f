//! Core domain model for Fairway: listings, persisted rows, history rows and the course directory.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "fairway-core";

/// Document collections shared by the persistence path.
pub const TEE_TIMES: &str = "tee_times";
pub const PRICE_HISTORY: &str = "price_history";
pub const DAILY_STATS: &str = "daily_stats";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Golfpang,
    Teescan,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Golfpang => "golfpang",
            Source::Teescan => "teescan",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock start time of a tee time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self {
            hour: hour as u8,
            minute: minute as u8,
        })
    }

    pub fn hour_bucket(&self) -> u8 {
        self.hour
    }

    /// `HHMM`, used inside document keys.
    pub fn compact(&self) -> String {
        format!("{:02}{:02}", self.hour, self.minute)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Inclusive range of prices accepted from either source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBounds {
    pub min: u32,
    pub max: u32,
}

impl Default for PriceBounds {
    fn default() -> Self {
        Self {
            min: 1_000,
            max: 10_000_000,
        }
    }
}

impl PriceBounds {
    pub fn contains(&self, price: u64) -> bool {
        price >= u64::from(self.min) && price <= u64::from(self.max)
    }
}

/// Canonical crawled unit: one tee-time offer for one course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub course: String,
    pub date: NaiveDate,
    pub time_of_day: TimeOfDay,
    pub hour_bucket: u8,
    pub price: u32,
    pub source: Source,
    pub raw_label: String,
}

impl Listing {
    pub fn new(
        course: impl Into<String>,
        date: NaiveDate,
        time_of_day: TimeOfDay,
        price: u32,
        source: Source,
        raw_label: impl Into<String>,
    ) -> Self {
        Self {
            course: course.into(),
            date,
            hour_bucket: time_of_day.hour_bucket(),
            time_of_day,
            price,
            source,
            raw_label: raw_label.into(),
        }
    }

    /// Display bucket such as `08시대`.
    pub fn hour_label(&self) -> String {
        format!("{:02}시대", self.hour_bucket)
    }

    pub fn dedup_key(&self) -> (String, NaiveDate, u8, u32) {
        (self.course.clone(), self.date, self.hour_bucket, self.price)
    }

    pub fn persisted_key(&self) -> String {
        tee_time_key(self.date, &self.course, &self.time_of_day.to_string())
    }

    /// Total order used for every merged crawl result.
    ///
    /// The primary key is `(date, hour_bucket, course, price)`; the remaining fields only
    /// break ties so identical inputs always produce identical output.
    pub fn order_cmp(&self, other: &Self) -> Ordering {
        self.date
            .cmp(&other.date)
            .then(self.hour_bucket.cmp(&other.hour_bucket))
            .then_with(|| self.course.cmp(&other.course))
            .then(self.price.cmp(&other.price))
            .then(self.time_of_day.cmp(&other.time_of_day))
            .then(self.source.cmp(&other.source))
            .then_with(|| self.raw_label.cmp(&other.raw_label))
    }
}

pub fn sort_listings(listings: &mut [Listing]) {
    listings.sort_by(Listing::order_cmp);
}

/// Drops later listings sharing `(course, date, hour_bucket, price)` with an earlier one.
/// Returns the number of dropped duplicates.
pub fn dedup_listings(listings: &mut Vec<Listing>) -> usize {
    let before = listings.len();
    let mut seen = HashSet::new();
    listings.retain(|l| seen.insert(l.dedup_key()));
    before - listings.len()
}

/// Canonical-name restriction on crawl output. Empty means "all courses".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteFilter {
    names: Vec<String>,
}

impl FavoriteFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names
                .into_iter()
                .map(Into::into)
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Exact or substring match against a canonical course name.
    pub fn matches(&self, course: &str) -> bool {
        self.names.is_empty()
            || self
                .names
                .iter()
                .any(|f| f == course || course.contains(f.as_str()))
    }
}

/// Document key of a persisted tee time: `YYYYMMDD_<club>_<HHMM>`.
pub fn tee_time_key(date: NaiveDate, club: &str, time_label: &str) -> String {
    format!(
        "{}_{}_{}",
        date.format("%Y%m%d"),
        club_key_fragment(club),
        time_label.replace(':', "")
    )
}

fn club_key_fragment(club: &str) -> String {
    club.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == '/' { '_' } else { c })
        .collect()
}

/// 0 = Monday … 6 = Sunday.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_monday() as u8
}

/// Persisted `tee_times` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeeTimeRecord {
    pub club_name: String,
    pub date: NaiveDate,
    pub time: String,
    pub hour: u8,
    pub price: u32,
    pub source: Source,
    pub weekday: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawled_at: Option<DateTime<Utc>>,
}

impl TeeTimeRecord {
    pub fn from_listing(listing: &Listing) -> Self {
        Self {
            club_name: listing.course.clone(),
            date: listing.date,
            time: listing.time_of_day.to_string(),
            hour: listing.hour_bucket,
            price: listing.price,
            source: listing.source,
            weekday: weekday_index(listing.date),
            crawled_at: None,
        }
    }

    pub fn key(&self) -> String {
        tee_time_key(self.date, &self.club_name, &self.time)
    }

    /// Fields that decide whether a re-crawled row needs a write.
    pub fn same_content(&self, other: &Self) -> bool {
        self.price == other.price && self.time == other.time && self.club_name == other.club_name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceStats {
    pub min: u32,
    pub avg: f64,
    pub count: u32,
}

impl PriceStats {
    pub fn from_prices(prices: &[u32]) -> Option<Self> {
        let min = *prices.iter().min()?;
        let sum: u64 = prices.iter().map(|p| u64::from(*p)).sum();
        Some(Self {
            min,
            avg: sum as f64 / prices.len() as f64,
            count: prices.len() as u32,
        })
    }
}

/// One `price_history` row written per aggregation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub club_name: String,
    pub date: NaiveDate,
    pub hour: u8,
    pub stats: PriceStats,
    pub snapshot_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    pub weekday: u8,
}

impl HistorySnapshot {
    pub fn key(&self) -> String {
        format!(
            "{}_{}_{:02}_{}",
            self.date.format("%Y%m%d"),
            club_key_fragment(&self.club_name),
            self.hour,
            self.snapshot_at.format("%H%M")
        )
    }
}

/// One `daily_stats` row per (club, date, hour).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStat {
    pub club_name: String,
    pub date: NaiveDate,
    pub hour: u8,
    pub min_price: u32,
    pub avg_price: f64,
    pub snapshot_count: u32,
}

impl DailyStat {
    pub fn key(&self) -> String {
        daily_stat_key(self.date, &self.club_name, self.hour)
    }

    pub fn same_stats(&self, other: &Self) -> bool {
        self.min_price == other.min_price
            && self.snapshot_count == other.snapshot_count
            && (self.avg_price - other.avg_price).abs() < 1e-6
    }
}

pub fn daily_stat_key(date: NaiveDate, club: &str, hour: u8) -> String {
    format!("{}_{}_{:02}", date.format("%Y%m%d"), club_key_fragment(club), hour)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceTrend {
    Up,
    Down,
    Flat,
    NoHistory,
}

/// Current per-hour minimum against the same hour one week earlier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceComparison {
    pub hour: u8,
    pub current_min: u32,
    pub last_week_min: Option<u32>,
}

impl PriceComparison {
    pub fn diff(&self) -> Option<i64> {
        self.last_week_min
            .map(|prev| i64::from(self.current_min) - i64::from(prev))
    }

    pub fn trend(&self) -> PriceTrend {
        match self.diff() {
            None => PriceTrend::NoHistory,
            Some(d) if d > 0 => PriceTrend::Up,
            Some(d) if d < 0 => PriceTrend::Down,
            Some(_) => PriceTrend::Flat,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CodeValue {
    Text(String),
    Number(u64),
}

fn code_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<CodeValue>::deserialize(deserializer)?;
    Ok(value
        .map(|v| match v {
            CodeValue::Text(s) => s.trim().to_string(),
            CodeValue::Number(n) => n.to_string(),
        })
        .filter(|s| !s.is_empty()))
}

/// Static reference data for one course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseDirectoryEntry {
    pub name: String,
    /// Club label as printed in Golfpang's booking table.
    #[serde(default, rename = "Golpang_code", deserialize_with = "code_string")]
    pub golfpang_code: Option<String>,
    #[serde(default, deserialize_with = "code_string")]
    pub golfpang_id: Option<String>,
    #[serde(default, rename = "seq", deserialize_with = "code_string")]
    pub teescan_seq: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    /// Golfpang sector the course is listed under, when known.
    #[serde(default)]
    pub sector: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CourseDirectory {
    entries: Vec<CourseDirectoryEntry>,
}

impl CourseDirectory {
    /// Keeps the first entry per canonical name; nameless entries are dropped.
    pub fn new(entries: Vec<CourseDirectoryEntry>) -> Self {
        let mut seen = HashSet::new();
        let entries = entries
            .into_iter()
            .filter(|e| !e.name.trim().is_empty())
            .filter(|e| seen.insert(e.name.clone()))
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[CourseDirectoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sorted_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.iter().map(|e| e.name.clone()).collect();
        names.sort();
        names
    }

    /// Golfpang targets for a sector: courses hinted to that sector or without a hint.
    pub fn golfpang_targets(
        &self,
        sector: u32,
        favorites: &FavoriteFilter,
    ) -> Vec<&CourseDirectoryEntry> {
        self.entries
            .iter()
            .filter(|e| e.golfpang_code.is_some())
            .filter(|e| favorites.matches(&e.name))
            .filter(|e| e.sector.map_or(true, |s| s == sector))
            .collect()
    }

    pub fn teescan_targets(&self, favorites: &FavoriteFilter) -> Vec<&CourseDirectoryEntry> {
        self.entries
            .iter()
            .filter(|e| e.teescan_seq.is_some())
            .filter(|e| favorites.matches(&e.name))
            .collect()
    }

    pub fn find_by_golfpang_id(&self, id: &str) -> Option<&CourseDirectoryEntry> {
        self.entries
            .iter()
            .find(|e| e.golfpang_id.as_deref() == Some(id))
    }
}

/// Whitespace/hyphen-insensitive name form with the `C.C` suffix canonicalized to `CC`.
/// Parenthetical qualifiers are kept so `X(대중)` and `X(회원제)` stay distinct.
pub fn normalize_course_name(name: &str) -> String {
    let compact: String = name.chars().filter(|c| !c.is_whitespace()).collect();
    canonicalize_cc_suffix(&compact).replace('-', "")
}

fn canonicalize_cc_suffix(name: &str) -> String {
    for suffix in ["C.C.", "C.C", "CC.", "CC"] {
        if let Some(stem) = name.strip_suffix(suffix) {
            return format!("{stem}CC");
        }
    }
    name.to_string()
}

/// Does a site label refer to the course whose directory code is `code`?
pub fn course_names_match(site_label: &str, code: &str) -> bool {
    let site = normalize_course_name(site_label);
    let code = normalize_course_name(code);
    if site == code {
        return true;
    }
    if code.is_empty() || !site.contains(code.as_str()) {
        return false;
    }
    let extra = site.replace(code.as_str(), "");
    !(extra.contains('(') || extra.contains(')'))
}
