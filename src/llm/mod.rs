//! Completion-service clients.
//!
//! Defines the [`LlmClient`] trait the orchestrator calls once per chunk,
//! and concrete implementations:
//! - **[`DisabledClient`]**: always fails; used when no provider is configured.
//! - **[`AnthropicClient`]**: Messages API with `cache_control` hints on
//!   stable system blocks.
//! - **[`OpenAiClient`]**: chat completions API (OpenAI or a compatible
//!   server); prompt caching is automatic there, so no hints are sent.
//!
//! # Provider Selection
//!
//! Use [`create_client`] to instantiate the client named by `llm.provider`.
//!
//! # Retry Strategy
//!
//! Clients make exactly one HTTP attempt per [`LlmClient::complete`] call
//! and classify failures through [`LlmError`]. Retrying is the caller's job
//! and is driven by [`RetryPolicy`]:
//! - transient failures (429, 5xx, network) and timeouts are retried
//! - permanent failures (other 4xx) fail immediately
//! - backoff doubles from `backoff_base` and is capped at 32x

pub mod anthropic;
pub mod openai;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use scorecard_core::advisor::{CacheCapabilities, SegmentKind};

use crate::config::LlmConfig;
use crate::error::LlmError;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;

/// One block of the system prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptBlock {
    pub kind: SegmentKind,
    pub text: String,
    /// Ask the provider to cache the prompt prefix ending at this block.
    pub cache_hint: bool,
}

/// A single chunk call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionRequest {
    /// Stable instructions, rubric and knowledge base, in order.
    pub system: Vec<PromptBlock>,
    /// Per-call content (the transcript chunk).
    pub user: String,
    pub max_output_tokens: u32,
}

impl CompletionRequest {
    pub fn has_cache_hints(&self) -> bool {
        self.system.iter().any(|b| b.cache_hint)
    }

    /// Copy of this request with every cache hint removed.
    pub fn without_cache_hints(&self) -> Self {
        let mut out = self.clone();
        for b in &mut out.system {
            b.cache_hint = false;
        }
        out
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

/// A completion service.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider identifier (e.g. `"anthropic"`).
    fn name(&self) -> &str;

    /// What prompt-cache hints this provider accepts.
    fn cache_capabilities(&self) -> CacheCapabilities {
        CacheCapabilities::unsupported()
    }

    /// Make one attempt at a completion.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;
}

/// A client that rejects every call.
pub struct DisabledClient;

#[async_trait]
impl LlmClient for DisabledClient {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, LlmError> {
        Err(LlmError::permanent("LLM provider is disabled"))
    }
}

/// Instantiate the configured client.
///
/// # Errors
///
/// Fails if the provider is unknown or its API key is missing.
pub fn create_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledClient)),
        "anthropic" => Ok(Arc::new(AnthropicClient::from_config(config)?)),
        "openai" => Ok(Arc::new(OpenAiClient::from_config(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

/// Per-chunk attempt limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Timeout for each attempt.
    pub timeout: Duration,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }

    /// Delay before attempt number `attempt` (1-based). No delay before the
    /// first attempt; then 1x, 2x, 4x … the base, capped at 32x.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.backoff_base
            .checked_mul(1u32 << (attempt - 2).min(5))
            .unwrap_or(Duration::MAX)
    }
}

/// Read an API key from the environment.
pub(crate) fn api_key(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => bail!("{} environment variable not set", var),
    }
}
