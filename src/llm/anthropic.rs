//! Anthropic Messages API client.
//!
//! Stable prompt blocks go in the structured `system` array; blocks the
//! advisor marked get `cache_control: {"type": "ephemeral"}`. If the API
//! rejects the hints, the request is sent once more without them.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use scorecard_core::advisor::CacheCapabilities;

use super::{api_key, Completion, CompletionRequest, LlmClient, Usage};
use crate::config::LlmConfig;
use crate::error::LlmError;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The Messages API accepts at most four cache breakpoints per request.
const MAX_BREAKPOINTS: usize = 4;

pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    prompt_caching: bool,
    min_cacheable_tokens: usize,
}

impl AnthropicClient {
    /// # Errors
    ///
    /// Fails if `llm.model` is unset or `ANTHROPIC_API_KEY` is missing.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for Anthropic provider"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key: api_key("ANTHROPIC_API_KEY")?,
            model,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            prompt_caching: config.prompt_caching,
            min_cacheable_tokens: config.min_cacheable_tokens,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    async fn send(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let body = build_request_body(&self.model, request);

        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body_text = response.text().await?;

        if status != 200 {
            return Err(LlmError::from_status(status, &body_text));
        }

        parse_response(&body_text)
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn cache_capabilities(&self) -> CacheCapabilities {
        if !self.prompt_caching {
            return CacheCapabilities::unsupported();
        }
        CacheCapabilities {
            supports_hints: true,
            max_breakpoints: MAX_BREAKPOINTS,
            min_cacheable_tokens: self.min_cacheable_tokens,
        }
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        match self.send(request).await {
            Err(err) if request.has_cache_hints() && rejects_cache_hints(&err) => {
                tracing::warn!(error = %err, "cache hints rejected, retrying without them");
                self.send(&request.without_cache_hints()).await
            }
            other => other,
        }
    }
}

fn rejects_cache_hints(err: &LlmError) -> bool {
    matches!(
        err,
        LlmError::Permanent { status: Some(400), message } if message.contains("cache_control")
    )
}

/// Build the Messages API payload.
pub fn build_request_body(model: &str, request: &CompletionRequest) -> serde_json::Value {
    let system: Vec<serde_json::Value> = request
        .system
        .iter()
        .filter(|b| !b.text.is_empty())
        .map(|b| {
            let mut block = serde_json::json!({ "type": "text", "text": b.text });
            if b.cache_hint {
                block["cache_control"] = serde_json::json!({ "type": "ephemeral" });
            }
            block
        })
        .collect();

    let mut body = serde_json::json!({
        "model": model,
        "max_tokens": request.max_output_tokens,
        "temperature": 0.0,
        "messages": [{ "role": "user", "content": request.user }],
    });
    if !system.is_empty() {
        body["system"] = serde_json::Value::Array(system);
    }
    body
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: ResponseUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}

fn parse_response(body: &str) -> Result<Completion, LlmError> {
    let parsed: MessagesResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::malformed(format!("Failed to parse response: {}", e)))?;

    if parsed.stop_reason.as_deref() == Some("max_tokens") {
        return Err(LlmError::malformed("response truncated at max_tokens"));
    }

    let text: String = parsed
        .content
        .iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text.as_deref())
        .collect();

    if text.trim().is_empty() {
        return Err(LlmError::malformed("response contained no text"));
    }

    Ok(Completion {
        text,
        usage: Usage {
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            cache_read_tokens: parsed.usage.cache_read_input_tokens.unwrap_or(0),
            cache_write_tokens: parsed.usage.cache_creation_input_tokens.unwrap_or(0),
        },
    })
}
