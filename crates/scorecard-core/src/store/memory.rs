//! In-memory [`DurableStore`] implementation for testing.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::ResultStatus;

use super::{CacheEntry, DurableStore, EntrySummary, HitRateStats, LookupOutcome, LookupRecord};

/// In-memory durable store.
///
/// [`set_unavailable`](InMemoryStore::set_unavailable) makes every call fail,
/// which lets tests exercise outage handling.
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    lookups: RwLock<Vec<LookupRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            lookups: RwLock::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw entry access, ignoring expiry.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().unwrap().get(key).cloned()
    }

    pub fn lookups(&self) -> Vec<LookupRecord> {
        self.lookups.read().unwrap().clone()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("durable store unavailable");
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn get_entry(&self, key: &str, now: i64) -> Result<Option<CacheEntry>> {
        self.check()?;
        let entries = self.entries.read().unwrap();
        Ok(entries.get(key).filter(|e| !e.is_expired(now)).cloned())
    }

    async fn put_entry(&self, entry: &CacheEntry) -> Result<bool> {
        self.check()?;
        let mut entries = self.entries.write().unwrap();
        if let Some(existing) = entries.get(&entry.key) {
            if !entry.supersedes(existing) {
                return Ok(false);
            }
        }
        entries.insert(entry.key.clone(), entry.clone());
        Ok(true)
    }

    async fn record_lookup(&self, record: &LookupRecord) -> Result<()> {
        self.check()?;
        self.lookups.write().unwrap().push(record.clone());
        Ok(())
    }

    async fn hit_rate(&self, dimension: Option<&str>) -> Result<HitRateStats> {
        self.check()?;
        let lookups = self.lookups.read().unwrap();
        let mut stats = HitRateStats::default();
        for r in lookups
            .iter()
            .filter(|r| dimension.map_or(true, |d| r.dimension == d))
        {
            stats.total += 1;
            match r.outcome {
                LookupOutcome::Distributed => stats.distributed_hits += 1,
                LookupOutcome::Durable => stats.durable_hits += 1,
                LookupOutcome::Miss => stats.misses += 1,
            }
        }
        Ok(stats)
    }

    async fn entry_summary(&self) -> Result<Vec<EntrySummary>> {
        self.check()?;
        let entries = self.entries.read().unwrap();
        let mut grouped: BTreeMap<(String, String), (u64, u64)> = BTreeMap::new();
        for e in entries.values() {
            let counts = grouped
                .entry((e.dimension.clone(), e.rubric_version.clone()))
                .or_insert((0, 0));
            match e.status() {
                ResultStatus::Complete => counts.0 += 1,
                ResultStatus::Partial => counts.1 += 1,
            }
        }
        Ok(grouped
            .into_iter()
            .map(|((dimension, rubric_version), (complete, partial))| EntrySummary {
                dimension,
                rubric_version,
                complete,
                partial,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnalysisResult;

    fn entry(key: &str, dimension: &str, status: ResultStatus, expires_at: i64) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            dimension: dimension.to_string(),
            rubric_version: "v1".to_string(),
            content_hash: "h".to_string(),
            call_id: "call-1".to_string(),
            result: AnalysisResult {
                dimension: dimension.to_string(),
                rubric_version: "v1".to_string(),
                cache_key: key.to_string(),
                content_hash: "h".to_string(),
                status,
                score: 1.0,
                criteria: BTreeMap::new(),
                findings: vec![],
                summary: String::new(),
                chunk_count: 1,
                failed_chunks: vec![],
            },
            created_at: 0,
            expires_at,
        }
    }

    fn lookup(dimension: &str, outcome: LookupOutcome) -> LookupRecord {
        LookupRecord {
            key: "k".to_string(),
            dimension: dimension.to_string(),
            rubric_version: "v1".to_string(),
            outcome,
            looked_up_at: 0,
        }
    }

    #[tokio::test]
    async fn test_put_get_and_expiry() {
        let store = InMemoryStore::new();
        store
            .put_entry(&entry("k1", "discovery", ResultStatus::Complete, 100))
            .await
            .unwrap();
        assert!(store.get_entry("k1", 99).await.unwrap().is_some());
        assert!(store.get_entry("k1", 100).await.unwrap().is_none());
        assert!(store.get_entry("missing", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = InMemoryStore::new();
        let e = entry("k1", "discovery", ResultStatus::Complete, 100);
        store.put_entry(&e).await.unwrap();
        store.put_entry(&e).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_hit_rate_by_dimension() {
        let store = InMemoryStore::new();
        for r in [
            lookup("discovery", LookupOutcome::Miss),
            lookup("discovery", LookupOutcome::Distributed),
            lookup("discovery", LookupOutcome::Durable),
            lookup("closing", LookupOutcome::Miss),
        ] {
            store.record_lookup(&r).await.unwrap();
        }
        let all = store.hit_rate(None).await.unwrap();
        assert_eq!(all.total, 4);
        assert_eq!(all.hits(), 2);
        let d = store.hit_rate(Some("discovery")).await.unwrap();
        assert_eq!(d.total, 3);
        assert!((d.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_entry_summary() {
        let store = InMemoryStore::new();
        store
            .put_entry(&entry("a", "discovery", ResultStatus::Complete, 100))
            .await
            .unwrap();
        store
            .put_entry(&entry("b", "discovery", ResultStatus::Partial, 100))
            .await
            .unwrap();
        store
            .put_entry(&entry("c", "closing", ResultStatus::Complete, 100))
            .await
            .unwrap();
        let summary = store.entry_summary().await.unwrap();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].dimension, "closing");
        assert_eq!((summary[1].complete, summary[1].partial), (1, 1));
    }

    #[tokio::test]
    async fn test_partial_never_replaces_live_complete() {
        let store = InMemoryStore::new();
        let complete = entry("k", "discovery", ResultStatus::Complete, 100);
        assert!(store.put_entry(&complete).await.unwrap());
        assert!(!store
            .put_entry(&entry("k", "discovery", ResultStatus::Partial, 200))
            .await
            .unwrap());
        assert_eq!(store.peek("k").unwrap(), complete);

        // Once the complete entry has expired the partial one may land.
        let mut late = entry("k", "discovery", ResultStatus::Partial, 300);
        late.created_at = 100;
        assert!(store.put_entry(&late).await.unwrap());
        assert_eq!(store.peek("k").unwrap().status(), ResultStatus::Partial);

        // And a complete result always replaces a partial one.
        assert!(store.put_entry(&complete).await.unwrap());
        assert_eq!(store.peek("k").unwrap().status(), ResultStatus::Complete);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(store.get_entry("k", 0).await.is_err());
        assert!(store
            .put_entry(&entry("k", "d", ResultStatus::Complete, 1))
            .await
            .is_err());
    }
}
