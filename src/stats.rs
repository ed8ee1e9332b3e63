//! Cache hit-rate statistics.
//!
//! Every number here is derived from durable-store queries (the lookup log
//! and the stored entries), never from in-process counters, so the report
//! is the same no matter which process or how many processes served the
//! lookups. Used by `scorecard stats`.

use anyhow::Result;
use serde::Serialize;

use scorecard_core::store::{DurableStore, EntrySummary, HitRateStats};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    pub dimension: Option<String>,
    pub lookups: HitRateStats,
    pub entries: Vec<EntrySummary>,
}

/// Gather the report, optionally for one dimension only.
pub async fn collect_stats(
    store: &dyn DurableStore,
    dimension: Option<&str>,
) -> Result<StatsReport> {
    let lookups = store.hit_rate(dimension).await?;
    let entries = store
        .entry_summary()
        .await?
        .into_iter()
        .filter(|e| dimension.map_or(true, |d| e.dimension == d))
        .collect();
    Ok(StatsReport {
        dimension: dimension.map(str::to_string),
        lookups,
        entries,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config, dimension: Option<&str>) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_calls: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM calls")
        .fetch_one(&pool)
        .await?;
    let last_lookup: Option<i64> = sqlx::query_scalar("SELECT MAX(looked_up_at) FROM cache_lookups")
        .fetch_one(&pool)
        .await?;

    let store = SqliteStore::new(pool.clone());
    let report = collect_stats(&store, dimension).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Scorecard: Cache Stats");
    println!("======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Calls:       {}", total_calls);
    if let Some(d) = dimension {
        println!("  Dimension:   {}", d);
    }
    println!();

    let l = &report.lookups;
    println!("  Lookups:     {}", l.total);
    println!("  Hits:        {} ({:.1}%)", l.hits(), l.hit_rate() * 100.0);
    println!("    distributed  {}", l.distributed_hits);
    println!("    durable      {}", l.durable_hits);
    println!("  Misses:      {}", l.misses);
    println!(
        "  Last lookup: {}",
        last_lookup
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );

    if !report.entries.is_empty() {
        println!();
        println!("  Stored results:");
        println!(
            "  {:<24} {:<12} {:>9} {:>8}",
            "DIMENSION", "VERSION", "COMPLETE", "PARTIAL"
        );
        println!("  {}", "-".repeat(56));
        for e in &report.entries {
            println!(
                "  {:<24} {:<12} {:>9} {:>8}",
                e.dimension, e.rubric_version, e.complete, e.partial
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        plural(delta / 60, "min")
    } else if delta < 86400 {
        plural(delta / 3600, "hour")
    } else if delta < 86400 * 30 {
        plural(delta / 86400, "day")
    } else {
        format_ts_iso(ts)
    }
}

fn plural(n: i64, unit: &str) -> String {
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
