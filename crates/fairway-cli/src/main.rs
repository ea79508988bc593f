use std::ops::RangeInclusive;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use fairway_adapters::AdapterContext;
use fairway_core::{FavoriteFilter, PriceTrend};
use fairway_sync::{build_scheduler, maybe_build_scheduler, SyncServices};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fairway")]
#[command(about = "Tee-time crawler, cache and price history")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Keep the in-memory cache refreshed until Ctrl-C, plus the cron jobs when enabled.
    Watch,
    /// Crawl the ingest window once and reconcile it into the store.
    Ingest,
    /// Snapshot upcoming prices and roll up yesterday's daily stats.
    Archive,
    /// Compare a club's hourly minimums with the same weekday last week.
    Compare {
        club: String,
        #[arg(value_parser = parse_date)]
        date: Option<NaiveDate>,
    },
    /// Crawl a date range and print the listings.
    Crawl {
        #[arg(value_parser = parse_date)]
        start: NaiveDate,
        #[arg(value_parser = parse_date)]
        end: Option<NaiveDate>,
        /// Hour buckets such as `6-9`.
        #[arg(long, value_parser = parse_hours)]
        hours: Option<RangeInclusive<u8>>,
        #[arg(long = "favorite")]
        favorites: Vec<String>,
    },
    /// Crawl one Golfpang club by id for a date.
    Course {
        golfpang_id: String,
        #[arg(value_parser = parse_date)]
        date: NaiveDate,
        #[arg(long, default_value_t = 5)]
        sector: u32,
    },
    /// Run the ingest and archive cron jobs until Ctrl-C.
    Schedule,
}

fn parse_date(text: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

fn parse_hours(text: &str) -> Result<RangeInclusive<u8>, String> {
    let (start, end) = text.split_once('-').unwrap_or((text, text));
    let start: u8 = start.trim().parse().map_err(|_| format!("bad hour in {text}"))?;
    let end: u8 = end.trim().parse().map_err(|_| format!("bad hour in {text}"))?;
    if start > 23 || end > 23 {
        return Err(format!("hours must be 0-23: {text}"));
    }
    Ok(start.min(end)..=start.max(end))
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env("FAIRWAY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let services = SyncServices::from_env().await?;

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Watch => {
            let cache = services.cache();
            let handle = cache.start();
            let mut sched = maybe_build_scheduler(Arc::new(services.pipeline())).await?;
            if let Some(sched) = &sched {
                sched.start().await.context("starting scheduler")?;
            }
            info!(
                config = ?cache.config(),
                scheduler = sched.is_some(),
                "refresh loop running; Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            if let Some(handle) = handle {
                handle.abort();
            }
            if let Some(sched) = sched.as_mut() {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Ingest => {
            let summary = services.pipeline().run_once().await;
            println!(
                "ingest complete: run_id={} dates={} listings={} upserted={} deleted={} \
                 failed_dates={}",
                summary.run_id,
                summary.dates.len(),
                summary.listings(),
                summary.upserted(),
                summary.deleted(),
                summary.failed_dates()
            );
        }
        Commands::Archive => {
            let summary = services.pipeline().archive_once().await?;
            println!(
                "archive complete: snapshots={} rollup_date={} daily_stats_written={} unchanged={}",
                summary.snapshots,
                summary.rollup_date,
                summary.rollup.written,
                summary.rollup.unchanged
            );
        }
        Commands::Compare { club, date } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let pipeline = services.pipeline();
            let result = pipeline.archiver().compare_week_over_week(&club, date).await?;
            if result.hours.is_empty() {
                println!("no current tee times for {club} on {date}");
                return Ok(());
            }
            let basis = if result.from_snapshots { "snapshots" } else { "daily stats" };
            println!("{club} {date} vs {} ({basis})", result.history_date);
            println!("{:<5} | {:>10} | {:>10} | {:>10}", "hour", "current", "last week", "diff");
            for row in &result.hours {
                let last_week = row
                    .last_week_min
                    .map_or_else(|| "n/a".to_string(), |p| p.to_string());
                let diff = match (row.diff(), row.trend()) {
                    (Some(d), PriceTrend::Up) => format!("+{d} up"),
                    (Some(d), PriceTrend::Down) => format!("{d} down"),
                    (Some(_), _) => "0".to_string(),
                    (None, _) => "-".to_string(),
                };
                println!(
                    "{:02}    | {:>10} | {:>10} | {:>10}",
                    row.hour, row.current_min, last_week, diff
                );
            }
        }
        Commands::Crawl {
            start,
            end,
            hours,
            favorites,
        } => {
            let cache = services.cache();
            let favorites = FavoriteFilter::new(favorites);
            let listings = cache
                .get_range(start, end.unwrap_or(start), hours, &favorites)
                .await;
            println!("{}", serde_json::to_string_pretty(&listings)?);
        }
        Commands::Course {
            golfpang_id,
            date,
            sector,
        } => {
            let adapter = services.golfpang().context("golfpang source is disabled")?;
            let outcome = adapter
                .crawl_course(&AdapterContext::new(), date, &golfpang_id, sector)
                .await?;
            info!(pages = outcome.pages, skips = %outcome.skips, "course crawl done");
            println!("{}", serde_json::to_string_pretty(&outcome.listings)?);
        }
        Commands::Schedule => {
            let pipeline = Arc::new(services.pipeline());
            let mut sched = build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!(
                ingest = %services.config.ingest_cron,
                archive = %services.config.archive_cron,
                "scheduler running; Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_ranges() {
        assert_eq!(parse_hours("6-9").unwrap(), 6..=9);
        assert_eq!(parse_hours("9-6").unwrap(), 6..=9);
        assert_eq!(parse_hours("13").unwrap(), 13..=13);
        assert!(parse_hours("7-24").is_err());
        assert!(parse_hours("dawn").is_err());
    }

    #[test]
    fn cli_parses_compare() {
        let cli = Cli::parse_from(["fairway", "compare", "한원CC", "2025-12-11"]);
        match cli.command {
            Some(Commands::Compare { club, date }) => {
                assert_eq!(club, "한원CC");
                assert_eq!(date, NaiveDate::from_ymd_opt(2025, 12, 11));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
