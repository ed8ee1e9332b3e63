//! Analysis orchestration.
//!
//! [`Analyzer::analyze`] drives one `(call, dimension, rubric version)`
//! request through
//!
//! ```text
//! Pending → Chunking → Calling → Merging → Cached → Done
//!                        │           └──────────────→ Partial
//!                        └→ Failed
//! ```
//!
//! A cache hit goes straight from `Pending` to `Done` without any
//! completion calls. On a miss every chunk is sent concurrently, each call
//! holding a permit from a semaphore shared by all analyses on this
//! `Analyzer`, with its own timeout and retry budget. Results are keyed by
//! chunk index and merged in that order, so the merged result does not
//! depend on completion order.
//!
//! Cancellation (explicit token or dropping the future) abandons in-flight
//! calls and writes nothing to the cache.

use anyhow::{Context, Result};
use futures::future::join_all;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use scorecard_core::advisor::advise;
use scorecard_core::chunk::{chunk_transcript, ChunkPlan, TranscriptChunk};
use scorecard_core::identity::{derive_key, CacheKey};
use scorecard_core::merge::merge_chunk_findings;
use scorecard_core::models::{
    AnalysisResult, AnalyzeOptions, ChunkFailure, ChunkFindings, ResultStatus, Transcript,
};
use scorecard_core::store::LookupOutcome;
use scorecard_core::tokenize::Tokenizer;

use crate::cache::{CacheSettings, PutReport, TwoTierCache};
use crate::config::Config;
use crate::distributed::MemoryTier;
use crate::error::{AnalysisError, LlmError};
use crate::hf_tokenizer::load_tokenizer;
use crate::llm::{create_client, CompletionRequest, LlmClient, RetryPolicy, Usage};
use crate::prompt::{build_request, build_segments, parse_chunk_findings};
use crate::rubric::{ConfigRubricStore, Rubric, RubricStore};
use crate::sqlite_store::SqliteStore;
use crate::transcripts::{SqliteTranscripts, TranscriptSource};

/// Lifecycle of one analysis request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Chunking,
    Calling,
    Merging,
    Cached,
    Done,
    Partial,
    Failed,
}

/// Where a returned result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Fresh,
    Distributed,
    Durable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub result: AnalysisResult,
    pub source: ResultSource,
    /// False when a fresh result could not be written to the durable store.
    /// Cached results are always persisted.
    pub persisted: bool,
    pub phases: Vec<Phase>,
    /// Completion attempts made, including retries.
    pub llm_calls: u32,
    pub usage: Usage,
}

impl AnalysisReport {
    pub fn is_partial(&self) -> bool {
        self.result.is_partial()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Analyzed(AnalysisReport),
    /// The transcript has no content; no key was derived and nothing cached.
    NothingToAnalyze { call_id: String },
}

impl AnalysisOutcome {
    pub fn report(&self) -> Option<&AnalysisReport> {
        match self {
            AnalysisOutcome::Analyzed(r) => Some(r),
            AnalysisOutcome::NothingToAnalyze { .. } => None,
        }
    }
}

/// Tunables for chunking and chunk calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyzerSettings {
    pub plan: ChunkPlan,
    pub retry: RetryPolicy,
    pub max_output_tokens: u32,
    pub max_concurrency: usize,
}

impl AnalyzerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            plan: config.chunking.plan(),
            retry: RetryPolicy::from_config(&config.llm),
            max_output_tokens: config.llm.max_output_tokens,
            max_concurrency: config.llm.max_concurrency.max(1),
        }
    }
}

/// One chunk's call outcome.
struct ChunkCall {
    index: usize,
    attempts: u32,
    usage: Usage,
    outcome: Result<ChunkFindings, LlmError>,
}

pub struct Analyzer {
    transcripts: Arc<dyn TranscriptSource>,
    rubrics: Arc<dyn RubricStore>,
    llm: Arc<dyn LlmClient>,
    tokenizer: Arc<dyn Tokenizer>,
    cache: Arc<TwoTierCache>,
    semaphore: Arc<Semaphore>,
    settings: AnalyzerSettings,
}

impl Analyzer {
    pub fn new(
        transcripts: Arc<dyn TranscriptSource>,
        rubrics: Arc<dyn RubricStore>,
        llm: Arc<dyn LlmClient>,
        tokenizer: Arc<dyn Tokenizer>,
        cache: Arc<TwoTierCache>,
        settings: AnalyzerSettings,
    ) -> Self {
        Self {
            transcripts,
            rubrics,
            llm,
            tokenizer,
            cache,
            semaphore: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
            settings,
        }
    }

    /// Wire up SQLite transcripts and durable store, configured rubrics,
    /// the configured completion client and tokenizer, and an in-process
    /// distributed tier.
    pub fn from_config(config: &Config, pool: SqlitePool) -> Result<Self> {
        let tier = Arc::new(MemoryTier::new(config.cache.distributed_capacity_bytes));
        let durable = Arc::new(SqliteStore::new(pool.clone()));
        let cache = TwoTierCache::new(tier, durable, CacheSettings::from_config(&config.cache));

        Ok(Self::new(
            Arc::new(SqliteTranscripts::new(pool)),
            Arc::new(ConfigRubricStore::from_config(config)?),
            create_client(&config.llm)?,
            load_tokenizer(&config.chunking.tokenizer)?,
            Arc::new(cache),
            AnalyzerSettings::from_config(config),
        ))
    }

    /// The rubric version new analyses of `dimension` should use.
    pub async fn current_version(&self, dimension: &str) -> Result<String> {
        self.rubrics
            .current_version(dimension)
            .await?
            .with_context(|| format!("No rubric configured for dimension: {}", dimension))
    }

    /// Analyze one dimension of a stored call.
    pub async fn analyze(
        &self,
        call_id: &str,
        dimension: &str,
        rubric_version: &str,
        options: AnalyzeOptions,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        let transcript = self.load_transcript(call_id).await?;
        self.analyze_transcript(&transcript, dimension, rubric_version, options)
            .await
    }

    /// Like [`analyze`](Self::analyze), abandoning the work when `cancel`
    /// fires.
    pub async fn analyze_cancellable(
        &self,
        call_id: &str,
        dimension: &str,
        rubric_version: &str,
        options: AnalyzeOptions,
        cancel: &CancellationToken,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(call_id, dimension, "analysis cancelled");
                Err(AnalysisError::Cancelled)
            }
            outcome = self.analyze(call_id, dimension, rubric_version, options) => outcome,
        }
    }

    /// Analyze several `(dimension, rubric_version)` pairs of one call
    /// concurrently. Results are returned in input order.
    pub async fn analyze_dimensions(
        &self,
        call_id: &str,
        dimensions: &[(String, String)],
        options: AnalyzeOptions,
    ) -> Result<Vec<(String, Result<AnalysisOutcome, AnalysisError>)>, AnalysisError> {
        let transcript = self.load_transcript(call_id).await?;
        let outcomes = join_all(dimensions.iter().map(|(dimension, version)| {
            self.analyze_transcript(&transcript, dimension, version, options)
        }))
        .await;
        Ok(dimensions
            .iter()
            .map(|(d, _)| d.clone())
            .zip(outcomes)
            .collect())
    }

    /// Analyze an already-loaded transcript.
    pub async fn analyze_transcript(
        &self,
        transcript: &Transcript,
        dimension: &str,
        rubric_version: &str,
        options: AnalyzeOptions,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        let span = tracing::info_span!(
            "analyze",
            request_id = %uuid::Uuid::new_v4(),
            call_id = %transcript.call_id,
            dimension,
            rubric_version,
        );
        self.run(transcript, dimension, rubric_version, options)
            .instrument(span)
            .await
    }

    async fn load_transcript(&self, call_id: &str) -> Result<Transcript, AnalysisError> {
        self.transcripts
            .load(call_id)
            .await
            .map_err(AnalysisError::input)?
            .ok_or_else(|| AnalysisError::TranscriptNotFound(call_id.to_string()))
    }

    async fn run(
        &self,
        transcript: &Transcript,
        dimension: &str,
        rubric_version: &str,
        options: AnalyzeOptions,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        let mut phases = Vec::new();
        enter(&mut phases, Phase::Pending);

        if transcript.is_blank() {
            tracing::debug!("transcript is blank, nothing to analyze");
            return Ok(AnalysisOutcome::NothingToAnalyze {
                call_id: transcript.call_id.clone(),
            });
        }

        let key = derive_key(dimension, transcript, rubric_version);

        if options.force_reanalysis {
            tracing::debug!(key = %key, "forced reanalysis, skipping cache lookup");
        } else {
            match self.cache.get(&key).await {
                Ok(Some(hit)) => {
                    enter(&mut phases, Phase::Done);
                    let source = match hit.source {
                        LookupOutcome::Distributed => ResultSource::Distributed,
                        _ => ResultSource::Durable,
                    };
                    return Ok(AnalysisOutcome::Analyzed(AnalysisReport {
                        result: shape(hit.result, options),
                        source,
                        persisted: true,
                        phases,
                        llm_calls: 0,
                        usage: Usage::default(),
                    }));
                }
                Ok(None) => {}
                Err(e) => {
                    let error = format!("{:#}", e);
                    tracing::warn!(key = %key, error = %error, "cache lookup failed, recomputing");
                }
            }
        }

        let rubric = self
            .rubrics
            .rubric(dimension, rubric_version)
            .await
            .map_err(AnalysisError::input)?
            .ok_or_else(|| AnalysisError::RubricNotFound(dimension.to_string()))?;

        enter(&mut phases, Phase::Chunking);
        let chunks = chunk_transcript(transcript, self.tokenizer.as_ref(), &self.settings.plan);
        if chunks.is_empty() {
            return Ok(AnalysisOutcome::NothingToAnalyze {
                call_id: transcript.call_id.clone(),
            });
        }
        tracing::debug!(
            chunks = chunks.len(),
            tokenizer = self.tokenizer.name(),
            "transcript chunked"
        );

        enter(&mut phases, Phase::Calling);
        let calls = self.call_chunks(&rubric, &chunks).await;

        let mut usage = Usage::default();
        let mut llm_calls = 0;
        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for call in calls {
            usage += call.usage;
            llm_calls += call.attempts;
            match call.outcome {
                Ok(findings) => successes.push((call.index, findings)),
                Err(e) => failures.push(ChunkFailure {
                    chunk_index: call.index,
                    attempts: call.attempts,
                    reason: e.to_string(),
                }),
            }
        }

        if successes.is_empty() {
            enter(&mut phases, Phase::Failed);
            return Err(AnalysisError::AllChunksFailed { failures });
        }

        enter(&mut phases, Phase::Merging);
        let merged = merge_chunk_findings(transcript, &chunks, &successes);
        if merged.dropped_findings > 0 {
            tracing::debug!(
                dropped = merged.dropped_findings,
                "dropped findings citing unknown utterances"
            );
        }

        let status = if failures.is_empty() {
            ResultStatus::Complete
        } else {
            tracing::warn!(
                failed = failures.len(),
                total = chunks.len(),
                "some chunks failed, result is partial"
            );
            ResultStatus::Partial
        };

        let result = AnalysisResult {
            dimension: dimension.to_string(),
            rubric_version: rubric_version.to_string(),
            cache_key: key.as_str().to_string(),
            content_hash: key.content_hash().as_str().to_string(),
            status,
            score: merged.score,
            criteria: merged.criteria,
            findings: merged.findings,
            summary: merged.summary,
            chunk_count: chunks.len(),
            failed_chunks: failures,
        };

        let report = self.persist(&key, &transcript.call_id, &result).await;
        let persisted = report.persisted;
        if persisted && !report.kept_existing {
            enter(&mut phases, Phase::Cached);
        }
        enter(
            &mut phases,
            match status {
                ResultStatus::Complete => Phase::Done,
                ResultStatus::Partial => Phase::Partial,
            },
        );

        Ok(AnalysisOutcome::Analyzed(AnalysisReport {
            result: shape(result, options),
            source: ResultSource::Fresh,
            persisted,
            phases,
            llm_calls,
            usage,
        }))
    }

    async fn persist(&self, key: &CacheKey, call_id: &str, result: &AnalysisResult) -> PutReport {
        let report = self
            .cache
            .put(key, call_id, result, self.cache.settings().ttl)
            .await;
        if !report.persisted {
            tracing::warn!(
                key = %key,
                error = report.durable_error.as_deref().unwrap_or(""),
                "result not persisted"
            );
        }
        report
    }

    /// Issue one call per chunk concurrently and collect outcomes in chunk
    /// order.
    async fn call_chunks(&self, rubric: &Rubric, chunks: &[TranscriptChunk]) -> Vec<ChunkCall> {
        let caps = self.llm.cache_capabilities();
        let requests: Vec<CompletionRequest> = chunks
            .iter()
            .map(|chunk| {
                let segments = build_segments(rubric, chunk, chunks.len());
                let plan = advise(&segments, self.tokenizer.as_ref(), &caps);
                build_request(&segments, &plan, self.settings.max_output_tokens)
            })
            .collect();

        if let Some(first) = requests.first() {
            tracing::debug!(
                hinted_blocks = first.system.iter().filter(|b| b.cache_hint).count(),
                provider = self.llm.name(),
                "prompt cache advice"
            );
        }

        join_all(
            requests
                .iter()
                .enumerate()
                .map(|(index, request)| self.call_chunk(index, request)),
        )
        .await
    }

    /// Call one chunk with timeout, retry and backoff.
    async fn call_chunk(&self, index: usize, request: &CompletionRequest) -> ChunkCall {
        let policy = self.settings.retry;
        let mut usage = Usage::default();
        let mut last_err = LlmError::transient("no attempt made");
        let mut attempts = 0;

        for attempt in 1..=policy.max_attempts {
            let delay = policy.backoff(attempt);
            if !delay.is_zero() {
                tracing::warn!(
                    chunk = index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_err,
                    "retrying chunk call"
                );
                tokio::time::sleep(delay).await;
            }

            attempts = attempt;
            let result = {
                let _permit = match self.semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        last_err = LlmError::permanent("analyzer shut down");
                        break;
                    }
                };
                tokio::time::timeout(policy.timeout, self.llm.complete(request)).await
            };

            let err = match result {
                Ok(Ok(completion)) => {
                    usage += completion.usage;
                    match parse_chunk_findings(&completion.text) {
                        Ok(findings) => {
                            return ChunkCall {
                                index,
                                attempts,
                                usage,
                                outcome: Ok(findings),
                            }
                        }
                        Err(e) => e,
                    }
                }
                Ok(Err(e)) => e,
                Err(_) => LlmError::Timeout(policy.timeout),
            };

            let retryable = err.is_retryable();
            last_err = err;
            if !retryable {
                break;
            }
        }

        tracing::warn!(chunk = index, attempts, error = %last_err, "chunk call failed");
        ChunkCall {
            index,
            attempts,
            usage,
            outcome: Err(last_err),
        }
    }
}

fn enter(phases: &mut Vec<Phase>, phase: Phase) {
    tracing::debug!(?phase, "analysis phase");
    phases.push(phase);
}

fn shape(result: AnalysisResult, options: AnalyzeOptions) -> AnalysisResult {
    if options.include_snippets {
        result
    } else {
        result.without_snippets()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcripts::MemoryTranscripts;
    use async_trait::async_trait;
    use scorecard_core::models::Utterance;
    use scorecard_core::store::memory::InMemoryStore;
    use scorecard_core::tokenize::WordTokenizer;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct CountingClient {
        calls: AtomicU32,
        reply: String,
    }

    #[async_trait]
    impl LlmClient for CountingClient {
        fn name(&self) -> &str {
            "counting"
        }

        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<crate::llm::Completion, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(crate::llm::Completion {
                text: self.reply.clone(),
                usage: Usage::default(),
            })
        }
    }

    fn analyzer(client: Arc<dyn LlmClient>, transcripts: Arc<MemoryTranscripts>) -> Analyzer {
        let cache = TwoTierCache::new(
            Arc::new(MemoryTier::new(1 << 20)),
            Arc::new(InMemoryStore::new()),
            CacheSettings::default(),
        );
        Analyzer::new(
            transcripts,
            Arc::new(ConfigRubricStore::from_rubrics([Rubric {
                dimension: "discovery".to_string(),
                version: "v1".to_string(),
                text: "Ask open questions.".to_string(),
                knowledge: vec![],
            }])),
            client,
            Arc::new(WordTokenizer),
            Arc::new(cache),
            AnalyzerSettings {
                plan: ChunkPlan::new(10_000, 0.2, 0),
                retry: RetryPolicy {
                    max_attempts: 2,
                    timeout: Duration::from_secs(5),
                    backoff_base: Duration::from_millis(1),
                },
                max_output_tokens: 256,
                max_concurrency: 2,
            },
        )
    }

    fn transcripts(utterances: Vec<Utterance>) -> Arc<MemoryTranscripts> {
        let t = Arc::new(MemoryTranscripts::new());
        t.insert(Transcript::new("call-1", utterances));
        t
    }

    fn utterance(text: &str) -> Utterance {
        Utterance {
            speaker: "Rep".to_string(),
            start_ms: 0,
            end_ms: 1000,
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_fresh_then_cached() {
        let client = Arc::new(CountingClient {
            calls: AtomicU32::new(0),
            reply: r#"{"score": 7, "findings": [{"criterion": "open", "utterance_index": 0, "observation": "good"}]}"#.to_string(),
        });
        let a = analyzer(client.clone(), transcripts(vec![utterance("What matters most?")]));

        let first = a
            .analyze("call-1", "discovery", "v1", AnalyzeOptions::default())
            .await
            .unwrap();
        let first = first.report().unwrap();
        assert_eq!(first.source, ResultSource::Fresh);
        assert_eq!(
            first.phases,
            vec![
                Phase::Pending,
                Phase::Chunking,
                Phase::Calling,
                Phase::Merging,
                Phase::Cached,
                Phase::Done
            ]
        );
        assert_eq!(first.result.findings[0].snippet.as_deref(), Some("What matters most?"));

        let second = a
            .analyze("call-1", "discovery", "v1", AnalyzeOptions::default())
            .await
            .unwrap();
        let second = second.report().unwrap();
        assert_eq!(second.source, ResultSource::Distributed);
        assert_eq!(second.phases, vec![Phase::Pending, Phase::Done]);
        assert_eq!(second.result, first.result);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blank_transcript_nothing_to_analyze() {
        let client = Arc::new(CountingClient {
            calls: AtomicU32::new(0),
            reply: "{}".to_string(),
        });
        let a = analyzer(client.clone(), transcripts(vec![utterance("   ")]));
        let outcome = a
            .analyze("call-1", "discovery", "v1", AnalyzeOptions::default())
            .await
            .unwrap();
        assert!(matches!(outcome, AnalysisOutcome::NothingToAnalyze { .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_call_and_rubric() {
        let client = Arc::new(CountingClient {
            calls: AtomicU32::new(0),
            reply: "{}".to_string(),
        });
        let a = analyzer(client, transcripts(vec![utterance("hi")]));
        assert!(matches!(
            a.analyze("nope", "discovery", "v1", AnalyzeOptions::default())
                .await,
            Err(AnalysisError::TranscriptNotFound(_))
        ));
        assert!(matches!(
            a.analyze("call-1", "discovery", "v9", AnalyzeOptions::default())
                .await,
            Err(AnalysisError::RubricNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_reply_fails_all_chunks() {
        let client = Arc::new(CountingClient {
            calls: AtomicU32::new(0),
            reply: "I refuse.".to_string(),
        });
        let a = analyzer(client.clone(), transcripts(vec![utterance("hi")]));
        let err = a
            .analyze("call-1", "discovery", "v1", AnalyzeOptions::default())
            .await
            .unwrap_err();
        let AnalysisError::AllChunksFailed { failures } = err else {
            panic!("expected AllChunksFailed");
        };
        assert_eq!(failures[0].attempts, 2);
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_snippets_stripped_on_request() {
        let client = Arc::new(CountingClient {
            calls: AtomicU32::new(0),
            reply: r#"{"score": 5, "findings": [{"criterion": "c", "utterance_index": 0, "observation": "o"}]}"#.to_string(),
        });
        let a = analyzer(client, transcripts(vec![utterance("quoted")]));
        let options = AnalyzeOptions {
            include_snippets: false,
            ..AnalyzeOptions::default()
        };
        let outcome = a.analyze("call-1", "discovery", "v1", options).await.unwrap();
        assert!(outcome.report().unwrap().result.findings[0].snippet.is_none());

        // The cached copy keeps them.
        let again = a
            .analyze("call-1", "discovery", "v1", AnalyzeOptions::default())
            .await
            .unwrap();
        assert_eq!(
            again.report().unwrap().result.findings[0].snippet.as_deref(),
            Some("quoted")
        );
    }
}
