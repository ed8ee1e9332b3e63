//! Two-tier result cache.
//!
//! # Read path
//!
//! 1. Distributed tier. A failure or undecodable payload is logged and
//!    treated as a miss.
//! 2. Durable store. A hit on a complete result is backfilled into the
//!    distributed tier with the entry's remaining TTL.
//! 3. Every lookup is appended to the durable lookup log (best effort).
//!
//! # Write path
//!
//! The durable store is written first and synchronously; its failure is
//! reported in [`PutReport::persisted`], never hidden. The distributed tier
//! is written best effort and only for complete results, so partial results
//! are never served from the accelerator.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use scorecard_core::identity::CacheKey;
use scorecard_core::models::AnalysisResult;
use scorecard_core::store::{CacheEntry, DurableStore, LookupOutcome, LookupRecord};

use crate::config::CacheConfig;
use crate::distributed::{decode_result, encode_result, DistributedCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub compress_threshold: usize,
    /// Serve stored partial results instead of reporting a miss.
    pub serve_partial: bool,
}

impl CacheSettings {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_secs),
            compress_threshold: config.compress_threshold_bytes,
            serve_partial: config.serve_partial,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// A cached result and the tier that served it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub result: AnalysisResult,
    pub source: LookupOutcome,
}

/// What a `put` managed to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReport {
    /// The durable store holds a result for the key: this one, or a live
    /// complete result it declined to replace with this partial one.
    pub persisted: bool,
    /// The durable store kept its existing complete result.
    pub kept_existing: bool,
    /// Written to the distributed tier.
    pub accelerated: bool,
    pub durable_error: Option<String>,
}

pub struct TwoTierCache {
    distributed: Arc<dyn DistributedCache>,
    durable: Arc<dyn DurableStore>,
    settings: CacheSettings,
}

impl TwoTierCache {
    pub fn new(
        distributed: Arc<dyn DistributedCache>,
        durable: Arc<dyn DurableStore>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            distributed,
            durable,
            settings,
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheHit>> {
        self.get_at(key, now_secs()).await
    }

    /// Look up `key` as of unix time `now`.
    ///
    /// Errors only when the distributed tier missed and the durable store
    /// failed.
    pub async fn get_at(&self, key: &CacheKey, now: i64) -> Result<Option<CacheHit>> {
        if let Some(result) = self.get_distributed(key).await {
            self.record(key, LookupOutcome::Distributed, now).await;
            return Ok(Some(CacheHit {
                result,
                source: LookupOutcome::Distributed,
            }));
        }

        let entry = match self.durable.get_entry(key.as_str(), now).await {
            Ok(entry) => entry,
            Err(e) => {
                // The lookup log lives in the same store; don't try to record.
                return Err(e.context("Durable cache lookup failed"));
            }
        };

        let Some(entry) = entry.filter(|e| self.settings.serve_partial || !e.result.is_partial())
        else {
            self.record(key, LookupOutcome::Miss, now).await;
            return Ok(None);
        };

        if !entry.result.is_partial() {
            let ttl = Duration::from_secs(entry.remaining_ttl_secs(now));
            self.put_distributed(key, &entry.result, ttl).await;
        }
        self.record(key, LookupOutcome::Durable, now).await;
        Ok(Some(CacheHit {
            result: entry.result,
            source: LookupOutcome::Durable,
        }))
    }

    pub async fn put(
        &self,
        key: &CacheKey,
        call_id: &str,
        result: &AnalysisResult,
        ttl: Duration,
    ) -> PutReport {
        self.put_at(key, call_id, result, ttl, now_secs()).await
    }

    pub async fn put_at(
        &self,
        key: &CacheKey,
        call_id: &str,
        result: &AnalysisResult,
        ttl: Duration,
        now: i64,
    ) -> PutReport {
        let entry = CacheEntry {
            key: key.as_str().to_string(),
            dimension: key.dimension().to_string(),
            rubric_version: key.rubric_version().to_string(),
            content_hash: key.content_hash().as_str().to_string(),
            call_id: call_id.to_string(),
            result: result.clone(),
            created_at: now,
            expires_at: now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)),
        };

        let (kept_existing, durable_error) = match self.durable.put_entry(&entry).await {
            Ok(written) => {
                if !written {
                    tracing::debug!(key = %key, "partial result not stored over a complete one");
                }
                (!written, None)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "durable cache write failed");
                (false, Some(format!("{:#}", e)))
            }
        };

        let accelerated = !result.is_partial() && self.put_distributed(key, result, ttl).await;

        PutReport {
            persisted: durable_error.is_none(),
            kept_existing,
            accelerated,
            durable_error,
        }
    }

    async fn get_distributed(&self, key: &CacheKey) -> Option<AnalysisResult> {
        let bytes = match self.distributed.get(key.as_str()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "distributed tier unavailable, using durable store");
                return None;
            }
        };
        match decode_result(&bytes) {
            Ok(result) if result.cache_key == key.as_str() => Some(result),
            Ok(_) => {
                tracing::warn!(key = %key, "distributed tier returned a result for another key");
                None
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "undecodable distributed entry");
                None
            }
        }
    }

    async fn put_distributed(&self, key: &CacheKey, result: &AnalysisResult, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return false;
        }
        let bytes = match encode_result(result, self.settings.compress_threshold) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to encode cache entry");
                return false;
            }
        };
        match self.distributed.put(key.as_str(), bytes, ttl).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "distributed tier write failed");
                false
            }
        }
    }

    async fn record(&self, key: &CacheKey, outcome: LookupOutcome, now: i64) {
        let record = LookupRecord {
            key: key.as_str().to_string(),
            dimension: key.dimension().to_string(),
            rubric_version: key.rubric_version().to_string(),
            outcome,
            looked_up_at: now,
        };
        if let Err(e) = self.durable.record_lookup(&record).await {
            tracing::debug!(key = %key, error = %e, "failed to record cache lookup");
        }
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
