//! Durable store abstraction for analysis results.
//!
//! The durable store is the source of truth for cached analyses: one row per
//! cache key holding the serialized [`AnalysisResult`], its creation time,
//! its expiry, and the dimension/rubric version as queryable columns. It
//! also records every lookup so hit rates can be derived by query rather
//! than from in-process counters.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{AnalysisResult, ResultStatus};

/// A stored analysis plus its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub dimension: String,
    pub rubric_version: String,
    pub content_hash: String,
    /// Call the result was first computed for.
    pub call_id: String,
    pub result: AnalysisResult,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds; the entry is absent from this instant on.
    pub expires_at: i64,
}

impl CacheEntry {
    pub fn status(&self) -> ResultStatus {
        self.result.status
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Whether writing `self` may replace `existing` under the same key.
    ///
    /// A partial result never replaces a complete one that is still live.
    pub fn supersedes(&self, existing: &CacheEntry) -> bool {
        !self.result.is_partial()
            || existing.result.is_partial()
            || existing.is_expired(self.created_at)
    }

    /// Seconds left before expiry, zero if already expired.
    pub fn remaining_ttl_secs(&self, now: i64) -> u64 {
        (self.expires_at - now).max(0) as u64
    }
}

/// Where a lookup was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupOutcome {
    Distributed,
    Durable,
    Miss,
}

impl LookupOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupOutcome::Distributed => "distributed",
            LookupOutcome::Durable => "durable",
            LookupOutcome::Miss => "miss",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "distributed" => Some(LookupOutcome::Distributed),
            "durable" => Some(LookupOutcome::Durable),
            "miss" => Some(LookupOutcome::Miss),
            _ => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        !matches!(self, LookupOutcome::Miss)
    }
}

/// One recorded cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRecord {
    pub key: String,
    pub dimension: String,
    pub rubric_version: String,
    pub outcome: LookupOutcome,
    pub looked_up_at: i64,
}

/// Aggregate lookup counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HitRateStats {
    pub total: u64,
    pub distributed_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
}

impl HitRateStats {
    pub fn hits(&self) -> u64 {
        self.distributed_hits + self.durable_hits
    }

    /// Hits over total lookups, `0.0` when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.hits() as f64 / self.total as f64
        }
    }
}

/// Stored entry counts for one `(dimension, rubric_version)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    pub dimension: String,
    pub rubric_version: String,
    pub complete: u64,
    pub partial: u64,
}

/// Durable, queryable storage for analysis results.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_entry`](DurableStore::get_entry) | Read an unexpired entry by key |
/// | [`put_entry`](DurableStore::put_entry) | Idempotent upsert keyed by cache key, see [`CacheEntry::supersedes`] |
/// | [`record_lookup`](DurableStore::record_lookup) | Append a lookup outcome |
/// | [`hit_rate`](DurableStore::hit_rate) | Aggregate recorded lookups |
/// | [`entry_summary`](DurableStore::entry_summary) | Stored entries per dimension/version |
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Fetch the entry for `key` unless it has expired at `now`.
    async fn get_entry(&self, key: &str, now: i64) -> Result<Option<CacheEntry>>;

    /// Insert or replace the entry for `entry.key`.
    ///
    /// Returns `false` when a live complete entry was kept because `entry`
    /// is partial.
    async fn put_entry(&self, entry: &CacheEntry) -> Result<bool>;

    /// Append one lookup record.
    async fn record_lookup(&self, record: &LookupRecord) -> Result<()>;

    /// Aggregate lookups, optionally for one dimension only.
    async fn hit_rate(&self, dimension: Option<&str>) -> Result<HitRateStats>;

    /// Count stored entries grouped by dimension and rubric version.
    async fn entry_summary(&self) -> Result<Vec<EntrySummary>>;
}
