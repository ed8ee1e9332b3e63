//! OpenAI-compatible chat completions client.
//!
//! Works against `api.openai.com` or any server speaking the same protocol
//! (set `llm.url`). Prompt caching there is automatic for repeated prefixes,
//! so the stable blocks are simply concatenated first in the system message
//! and no hints are sent.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{api_key, Completion, CompletionRequest, LlmClient, Usage};
use crate::config::LlmConfig;
use crate::error::LlmError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiClient {
    /// # Errors
    ///
    /// Fails if `llm.model` is unset or `OPENAI_API_KEY` is missing.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key: api_key("OPENAI_API_KEY")?,
            model,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let body = build_request_body(&self.model, request);

        let response = self
            .client
            .post(format!(
                "{}/v1/chat/completions",
                self.base_url.trim_end_matches('/')
            ))
            .header("Authorization", format!("Bearer {}", self.api_key))
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

pub fn build_request_body(model: &str, request: &CompletionRequest) -> serde_json::Value {
    let system = request
        .system
        .iter()
        .map(|b| b.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    serde_json::json!({
        "model": model,
        "max_tokens": request.max_output_tokens,
        "temperature": 0.0,
        "response_format": { "type": "json_object" },
        "messages": [
            { "role": "system", "content": system },
            { "role": "user", "content": request.user },
        ],
    })
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

fn parse_response(body: &str) -> Result<Completion, LlmError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::malformed(format!("Failed to parse response: {}", e)))?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::malformed("response has no choices"))?;

    if choice.finish_reason.as_deref() == Some("length") {
        return Err(LlmError::malformed("response truncated at max_tokens"));
    }

    let text = choice
        .message
        .content
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| LlmError::malformed("response contained no text"))?;

    let usage = parsed
        .usage
        .map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            cache_read_tokens: u.prompt_tokens_details.map_or(0, |d| d.cached_tokens),
            cache_write_tokens: 0,
        })
        .unwrap_or_default();

    Ok(Completion { text, usage })
}
