use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use scorecard_core::chunk::{ChunkPlan, MIN_CHUNK_TOKENS};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub rubrics: BTreeMap<String, RubricConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_fraction")]
    pub overlap_fraction: f64,
    #[serde(default = "default_min_overlap_tokens")]
    pub min_overlap_tokens: usize,
    /// `"word"` or a path to a HuggingFace `tokenizer.json`.
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_fraction: default_overlap_fraction(),
            min_overlap_tokens: default_min_overlap_tokens(),
            tokenizer: default_tokenizer(),
        }
    }
}

impl ChunkingConfig {
    pub fn plan(&self) -> ChunkPlan {
        ChunkPlan::new(
            self.max_tokens,
            self.overlap_fraction,
            self.min_overlap_tokens,
        )
    }
}

fn default_max_tokens() -> usize {
    80_000
}
fn default_overlap_fraction() -> f64 {
    0.2
}
fn default_min_overlap_tokens() -> usize {
    32
}
fn default_tokenizer() -> String {
    "word".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_compress_threshold")]
    pub compress_threshold_bytes: usize,
    #[serde(default = "default_distributed_capacity")]
    pub distributed_capacity_bytes: u64,
    /// Return stored partial results instead of recomputing them.
    #[serde(default)]
    pub serve_partial: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            compress_threshold_bytes: default_compress_threshold(),
            distributed_capacity_bytes: default_distributed_capacity(),
            serve_partial: false,
        }
    }
}

fn default_ttl_secs() -> u64 {
    30 * 24 * 60 * 60
}
fn default_compress_threshold() -> usize {
    4096
}
fn default_distributed_capacity() -> u64 {
    64 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL override, e.g. a proxy or an OpenAI-compatible server.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_true")]
    pub prompt_caching: bool,
    #[serde(default = "default_min_cacheable_tokens")]
    pub min_cacheable_tokens: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            max_output_tokens: default_max_output_tokens(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            max_concurrency: default_max_concurrency(),
            prompt_caching: true,
            min_cacheable_tokens: default_min_cacheable_tokens(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_output_tokens() -> u32 {
    4096
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_max_concurrency() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_min_cacheable_tokens() -> usize {
    1024
}

/// Scoring criteria for one dimension.
#[derive(Debug, Deserialize, Clone)]
pub struct RubricConfig {
    pub version: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub text_path: Option<PathBuf>,
    #[serde(default)]
    pub knowledge_paths: Vec<PathBuf>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_tokens <= MIN_CHUNK_TOKENS {
        anyhow::bail!("chunking.max_tokens must be > {}", MIN_CHUNK_TOKENS);
    }

    if !(0.0..0.5).contains(&config.chunking.overlap_fraction) {
        anyhow::bail!("chunking.overlap_fraction must be in [0.0, 0.5)");
    }

    if config.chunking.min_overlap_tokens * 2 >= config.chunking.max_tokens {
        anyhow::bail!("chunking.min_overlap_tokens must be < max_tokens / 2");
    }

    // Validate cache
    if config.cache.ttl_secs == 0 {
        anyhow::bail!("cache.ttl_secs must be > 0");
    }

    // Validate llm
    if config.llm.max_attempts == 0 {
        anyhow::bail!("llm.max_attempts must be >= 1");
    }
    if config.llm.max_concurrency == 0 {
        anyhow::bail!("llm.max_concurrency must be >= 1");
    }
    if config.llm.timeout_secs == 0 {
        anyhow::bail!("llm.timeout_secs must be > 0");
    }

    match config.llm.provider.as_str() {
        "disabled" | "anthropic" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled, anthropic, or openai.",
            other
        ),
    }

    if config.llm.is_enabled() && config.llm.model.is_none() {
        anyhow::bail!(
            "llm.model must be specified when provider is '{}'",
            config.llm.provider
        );
    }

    // Validate rubrics
    for (dimension, rubric) in &config.rubrics {
        if rubric.version.trim().is_empty() {
            anyhow::bail!("rubrics.{}.version must not be empty", dimension);
        }
        if rubric.text.is_some() == rubric.text_path.is_some() {
            anyhow::bail!(
                "rubrics.{} must set exactly one of text or text_path",
                dimension
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let config = parse("[db]\npath = \"./data/sc.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.max_tokens, 80_000);
        assert_eq!(config.chunking.overlap_fraction, 0.2);
        assert_eq!(config.cache.ttl_secs, 2_592_000);
        assert_eq!(config.cache.compress_threshold_bytes, 4096);
        assert!(!config.cache.serve_partial);
        assert_eq!(config.llm.provider, "disabled");
        assert_eq!(config.llm.max_attempts, 3);
        assert!(config.rubrics.is_empty());
    }

    #[test]
    fn test_rubrics_parse() {
        let config = parse(
            r#"
            [db]
            path = "x.sqlite"

            [rubrics.discovery]
            version = "v3"
            text = "Ask open questions."
            knowledge_paths = ["kb/discovery.md"]
            "#,
        )
        .unwrap();
        let r = &config.rubrics["discovery"];
        assert_eq!(r.version, "v3");
        assert_eq!(r.knowledge_paths.len(), 1);
    }

    #[test]
    fn test_rejects_bad_overlap() {
        let err = parse("[db]\npath = \"x\"\n[chunking]\noverlap_fraction = 0.6\n").unwrap_err();
        assert!(err.to_string().contains("overlap_fraction"));
    }

    #[test]
    fn test_rejects_small_max_tokens() {
        assert!(parse("[db]\npath = \"x\"\n[chunking]\nmax_tokens = 8\n").is_err());
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = parse("[db]\npath = \"x\"\n[llm]\nprovider = \"cohere\"\nmodel = \"m\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("Unknown llm provider"));
    }

    #[test]
    fn test_enabled_provider_needs_model() {
        assert!(parse("[db]\npath = \"x\"\n[llm]\nprovider = \"anthropic\"\n").is_err());
    }

    #[test]
    fn test_rubric_needs_one_text_source() {
        let err = parse("[db]\npath = \"x\"\n[rubrics.d]\nversion = \"v1\"\n").unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }
}
