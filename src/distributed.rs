//! Fast accelerator tier in front of the durable store.
//!
//! The engine talks to the tier through [`DistributedCache`], a byte-level
//! `get`/`put` contract. [`MemoryTier`] is the bundled implementation: a
//! `moka` cache bounded by total payload bytes, with a per-entry TTL. It may
//! evict at any time under memory pressure; callers treat every miss alike.
//!
//! Payloads are wrapped in a one-byte envelope by [`encode_result`]:
//!
//! | Tag | Body |
//! |-----|------|
//! | `0` | JSON |
//! | `1` | gzip-compressed JSON |
//!
//! Bodies at or above the compression threshold are gzipped.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use moka::future::Cache;
use moka::Expiry;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use scorecard_core::models::AnalysisResult;

/// Longest TTL handed to the in-process tier.
const MAX_TIER_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

const TAG_PLAIN: u8 = 0;
const TAG_GZIP: u8 = 1;

/// Byte-level distributed cache contract.
///
/// `get` failures are degradable (the caller falls back to the durable
/// store); `put` is best effort.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, bytes: Vec<u8>, ttl: Duration) -> Result<()>;
}

#[derive(Clone)]
struct TierValue {
    bytes: Arc<Vec<u8>>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, TierValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &TierValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl.min(MAX_TIER_TTL))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &TierValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl.min(MAX_TIER_TTL))
    }
}

/// In-process, size-bounded tier backed by `moka`.
pub struct MemoryTier {
    cache: Cache<String, TierValue>,
}

impl MemoryTier {
    /// Create a tier holding at most roughly `capacity_bytes` of keys and
    /// payloads.
    pub fn new(capacity_bytes: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity_bytes)
            .weigher(|key: &String, value: &TierValue| -> u32 {
                (key.len() + value.bytes.len())
                    .try_into()
                    .unwrap_or(u32::MAX)
            })
            .expire_after(PerEntryTtl)
            .build();

        Self { cache }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Apply pending evictions and expirations. Mostly useful in tests.
    pub async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl DistributedCache for MemoryTier {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.cache.get(key).await.map(|v| v.bytes.as_ref().clone()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Ok(());
        }
        self.cache
            .insert(
                key.to_string(),
                TierValue {
                    bytes: Arc::new(bytes),
                    ttl,
                },
            )
            .await;
        Ok(())
    }
}

/// Serialize a result into an envelope, gzipping bodies of at least
/// `compress_threshold` bytes.
pub fn encode_result(result: &AnalysisResult, compress_threshold: usize) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(result)?;
    if json.len() < compress_threshold {
        let mut out = Vec::with_capacity(json.len() + 1);
        out.push(TAG_PLAIN);
        out.extend_from_slice(&json);
        return Ok(out);
    }

    let mut encoder = GzEncoder::new(vec![TAG_GZIP], Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Inverse of [`encode_result`].
pub fn decode_result(bytes: &[u8]) -> Result<AnalysisResult> {
    let Some((&tag, body)) = bytes.split_first() else {
        bail!("Empty cache envelope");
    };
    match tag {
        TAG_PLAIN => serde_json::from_slice(body).context("Invalid cached JSON"),
        TAG_GZIP => {
            let mut json = Vec::new();
            GzDecoder::new(body)
                .read_to_end(&mut json)
                .context("Invalid gzip payload")?;
            serde_json::from_slice(&json).context("Invalid cached JSON")
        }
        other => bail!("Unknown cache envelope tag: {}", other),
    }
}

/// True when `bytes` holds a compressed envelope.
pub fn is_compressed(bytes: &[u8]) -> bool {
    bytes.first() == Some(&TAG_GZIP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scorecard_core::models::{Finding, ResultStatus};
    use std::collections::BTreeMap;

    fn result(findings: usize) -> AnalysisResult {
        AnalysisResult {
            dimension: "discovery".to_string(),
            rubric_version: "v1".to_string(),
            cache_key: "discovery:h:v1".to_string(),
            content_hash: "h".to_string(),
            status: ResultStatus::Complete,
            score: 6.5,
            criteria: BTreeMap::new(),
            findings: (0..findings)
                .map(|i| Finding {
                    criterion: "questions".to_string(),
                    utterance_index: i,
                    timestamp_ms: i as u64 * 1000,
                    observation: "Rep asked an open question about budget".to_string(),
                    snippet: Some("What does your budget look like this year?".to_string()),
                })
                .collect(),
            summary: "Solid discovery.".to_string(),
            chunk_count: 1,
            failed_chunks: vec![],
        }
    }

    #[test]
    fn test_small_payload_stays_plain() {
        let r = result(1);
        let bytes = encode_result(&r, 4096).unwrap();
        assert!(!is_compressed(&bytes));
        assert_eq!(decode_result(&bytes).unwrap(), r);
    }

    #[test]
    fn test_large_payload_compressed() {
        let r = result(200);
        let plain_len = serde_json::to_vec(&r).unwrap().len();
        let bytes = encode_result(&r, 4096).unwrap();
        assert!(is_compressed(&bytes));
        assert!(bytes.len() < plain_len / 2);
        assert_eq!(decode_result(&bytes).unwrap(), r);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_result(&[]).is_err());
        assert!(decode_result(&[9, 1, 2]).is_err());
        assert!(decode_result(&[TAG_GZIP, 1, 2, 3]).is_err());
    }

    #[tokio::test]
    async fn test_memory_tier_get_put() {
        let tier = MemoryTier::new(1024 * 1024);
        assert!(tier.get("k").await.unwrap().is_none());
        tier.put("k", vec![1, 2, 3], Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(tier.get("k").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_memory_tier_ttl_expires() {
        let tier = MemoryTier::new(1024 * 1024);
        tier.put("k", vec![1], Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(tier.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_tier_accepts_huge_ttl() {
        let tier = MemoryTier::new(1024 * 1024);
        tier.put("k", vec![7], Duration::MAX).await.unwrap();
        assert_eq!(tier.get("k").await.unwrap(), Some(vec![7]));
    }

    #[tokio::test]
    async fn test_memory_tier_bounded_by_bytes() {
        let tier = MemoryTier::new(4096);
        for i in 0..64 {
            tier.put(&format!("k{}", i), vec![0u8; 512], Duration::from_secs(60))
                .await
                .unwrap();
        }
        tier.sync().await;
        assert!(tier.entry_count() <= 8);
    }
}
