//! Text-level normalization shared by the source parsers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use chrono::{Datelike, NaiveDate};
use fairway_core::{PriceBounds, TimeOfDay};
use regex::Regex;
use serde::Serialize;

/// Phrases sources print instead of a number when the price is "ask us".
const PRICE_PLACEHOLDERS: &[&str] = &["문의", "상담", "확인", "전화", "call", "tbd", "미정", "inquire"];

// The patterns below are literals; compiling them cannot fail.
fn clock_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,2})\s*:\s*(\d{2})").expect("valid clock regex"))
}

fn korean_hour_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d{1,2})\s*시(?:\s*(\d{1,2})\s*분)?").expect("valid hour regex")
    })
}

fn month_day_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,2})\s*월\s*(\d{1,2})\s*일").expect("valid date regex"))
}

fn price_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9][0-9,]{3,})\s*원?").expect("valid price regex"))
}

/// Parses a displayed price. Placeholder phrases and out-of-range values yield `None`.
pub fn parse_price(text: &str, bounds: PriceBounds) -> Option<u32> {
    let lower = text.to_lowercase();
    if PRICE_PLACEHOLDERS.iter().any(|p| lower.contains(p)) {
        return None;
    }
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    let value: u64 = digits.parse().ok()?;
    if !bounds.contains(value) {
        return None;
    }
    u32::try_from(value).ok()
}

/// First `1,234`-shaped token in free row text.
pub fn find_price_token(text: &str) -> Option<&str> {
    price_token_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Accepts `HH:MM`, `H시` and `H시MM분`.
pub fn parse_time_label(text: &str) -> Option<TimeOfDay> {
    if let Some(caps) = clock_re().captures(text) {
        let hour = caps.get(1)?.as_str().parse().ok()?;
        let minute = caps.get(2)?.as_str().parse().ok()?;
        return TimeOfDay::new(hour, minute);
    }
    let caps = korean_hour_re().captures(text)?;
    let hour = caps.get(1)?.as_str().parse().ok()?;
    let minute = match caps.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    TimeOfDay::new(hour, minute)
}

/// `(month, day)` from a label such as `12월 11일 (목)`.
pub fn parse_month_day(text: &str) -> Option<(u32, u32)> {
    let caps = month_day_re().captures(text)?;
    Some((caps.get(1)?.as_str().parse().ok()?, caps.get(2)?.as_str().parse().ok()?))
}

pub fn same_month_day(target: NaiveDate, text: &str) -> bool {
    parse_month_day(text) == Some((target.month(), target.day()))
}

pub fn is_maintenance_html(text: &str) -> bool {
    (text.contains("점검") && text.contains("서비스"))
        || text.contains("점검중")
        || text.contains("점검 중")
}

/// Joins whitespace-separated fragments with single spaces.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    DateMismatch,
    UnmatchedClub,
    NoPrice,
    BadTime,
    Duplicate,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::DateMismatch => "date_mismatch",
            SkipReason::UnmatchedClub => "unmatched_club",
            SkipReason::NoPrice => "no_price",
            SkipReason::BadTime => "bad_time",
            SkipReason::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SkipCounts(BTreeMap<SkipReason, usize>);

impl SkipCounts {
    pub fn record(&mut self, reason: SkipReason) {
        *self.0.entry(reason).or_default() += 1;
    }

    pub fn get(&self, reason: SkipReason) -> usize {
        self.0.get(&reason).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    pub fn merge(&mut self, other: &SkipCounts) {
        for (reason, count) in &other.0 {
            *self.0.entry(*reason).or_default() += count;
        }
    }
}

impl fmt::Display for SkipCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<_> = self
            .0
            .iter()
            .map(|(reason, count)| format!("{}={count}", reason.as_str()))
            .collect();
        f.write_str(&parts.join(" "))
    }
}
