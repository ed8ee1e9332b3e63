//! SQLite-backed [`DurableStore`] implementation.
//!
//! One `analysis_cache` row per cache key holds the serialized result, with
//! dimension, rubric version, content hash and status as plain columns so
//! they can be queried without parsing keys or JSON. Every lookup appends a
//! `cache_lookups` row; hit rates are computed from that table.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use scorecard_core::models::AnalysisResult;
use scorecard_core::store::{
    CacheEntry, DurableStore, EntrySummary, HitRateStats, LookupOutcome, LookupRecord,
};

/// SQLite implementation of the [`DurableStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get_entry(&self, key: &str, now: i64) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            r#"
            SELECT cache_key, dimension, rubric_version, content_hash, call_id,
                   result_json, created_at, expires_at
            FROM analysis_cache
            WHERE cache_key = ? AND expires_at > ?
            "#,
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let result_json: String = row.get("result_json");
        let result: AnalysisResult = serde_json::from_str(&result_json)
            .with_context(|| format!("Corrupt cached result for key {}", key))?;

        Ok(Some(CacheEntry {
            key: row.get("cache_key"),
            dimension: row.get("dimension"),
            rubric_version: row.get("rubric_version"),
            content_hash: row.get("content_hash"),
            call_id: row.get("call_id"),
            result,
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn put_entry(&self, entry: &CacheEntry) -> Result<bool> {
        let result_json = serde_json::to_string(&entry.result)?;
        // Same rule as `CacheEntry::supersedes`.
        let written = sqlx::query(
            r#"
            INSERT INTO analysis_cache (cache_key, dimension, rubric_version, content_hash,
                                        call_id, status, result_json, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(cache_key) DO UPDATE SET
                status = excluded.status,
                result_json = excluded.result_json,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            WHERE excluded.status = 'complete'
               OR analysis_cache.status = 'partial'
               OR analysis_cache.expires_at <= excluded.created_at
            "#,
        )
        .bind(&entry.key)
        .bind(&entry.dimension)
        .bind(&entry.rubric_version)
        .bind(&entry.content_hash)
        .bind(&entry.call_id)
        .bind(entry.status().as_str())
        .bind(&result_json)
        .bind(entry.created_at)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(written > 0)
    }

    async fn record_lookup(&self, record: &LookupRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_lookups (cache_key, dimension, rubric_version, outcome, looked_up_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.key)
        .bind(&record.dimension)
        .bind(&record.rubric_version)
        .bind(record.outcome.as_str())
        .bind(record.looked_up_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn hit_rate(&self, dimension: Option<&str>) -> Result<HitRateStats> {
        let rows = sqlx::query(
            r#"
            SELECT outcome, COUNT(*) AS n
            FROM cache_lookups
            WHERE ?1 IS NULL OR dimension = ?1
            GROUP BY outcome
            "#,
        )
        .bind(dimension)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = HitRateStats::default();
        for row in rows {
            let outcome: String = row.get("outcome");
            let n: i64 = row.get("n");
            let n = n as u64;
            stats.total += n;
            match LookupOutcome::parse(&outcome) {
                Some(LookupOutcome::Distributed) => stats.distributed_hits += n,
                Some(LookupOutcome::Durable) => stats.durable_hits += n,
                Some(LookupOutcome::Miss) | None => stats.misses += n,
            }
        }
        Ok(stats)
    }

    async fn entry_summary(&self) -> Result<Vec<EntrySummary>> {
        let rows = sqlx::query(
            r#"
            SELECT dimension, rubric_version,
                   SUM(CASE WHEN status = 'complete' THEN 1 ELSE 0 END) AS complete,
                   SUM(CASE WHEN status = 'partial' THEN 1 ELSE 0 END) AS partial
            FROM analysis_cache
            GROUP BY dimension, rubric_version
            ORDER BY dimension, rubric_version
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let complete: i64 = row.get("complete");
                let partial: i64 = row.get("partial");
                EntrySummary {
                    dimension: row.get("dimension"),
                    rubric_version: row.get("rubric_version"),
                    complete: complete as u64,
                    partial: partial as u64,
                }
            })
            .collect())
    }
}
