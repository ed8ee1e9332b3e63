//! Error taxonomy for analysis requests and completion calls.
//!
//! Plumbing (config, SQLite, CLI) uses `anyhow`. The two enums here are the
//! typed surface callers branch on: [`LlmError`] decides whether a chunk
//! call is retried, and [`AnalysisError`] is the request-level outcome when
//! no result can be returned at all.

use std::time::Duration;
use thiserror::Error;

use scorecard_core::models::ChunkFailure;

/// Failure of a single completion call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// Rate limited, overloaded, 5xx, or a network error.
    #[error("Transient LLM failure{}: {message}", fmt_status(.status))]
    Transient {
        status: Option<u16>,
        message: String,
    },

    /// Rejected request (bad key, bad model, bad payload). Not retried.
    #[error("LLM request rejected{}: {message}", fmt_status(.status))]
    Permanent {
        status: Option<u16>,
        message: String,
    },

    /// The attempt exceeded its per-call timeout.
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    /// The response did not contain the expected structured findings.
    #[error("Malformed LLM response: {0}")]
    Malformed(String),
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

impl LlmError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            status: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            status: None,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Classify an HTTP error status: 408, 409, 429 and 5xx are transient,
    /// other 4xx are permanent.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = truncate(body, 500);
        match status {
            408 | 409 | 429 | 500..=599 => Self::Transient {
                status: Some(status),
                message,
            },
            _ => Self::Permanent {
                status: Some(status),
                message,
            },
        }
    }

    /// Whether another attempt may succeed.
    ///
    /// Malformed output is retried: completions are not deterministic and a
    /// second attempt commonly returns valid JSON.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::Permanent { .. })
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return LlmError::transient(format!("request timed out: {}", e));
        }
        if let Some(status) = e.status() {
            return LlmError::from_status(status.as_u16(), &e.to_string());
        }
        if e.is_decode() {
            return LlmError::malformed(e.to_string());
        }
        LlmError::transient(e.to_string())
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => format!("{}…", &s[..i]),
        None => s.to_string(),
    }
}

/// Request-level failure of `analyze`.
///
/// A blank transcript is not an error; see
/// [`AnalysisOutcome::NothingToAnalyze`](crate::orchestrator::AnalysisOutcome).
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Transcript not found: {0}")]
    TranscriptNotFound(String),

    #[error("No rubric configured for dimension '{0}'")]
    RubricNotFound(String),

    /// Every chunk exhausted its retries.
    #[error("All {} chunk calls failed{}", .failures.len(), first_reason(.failures))]
    AllChunksFailed { failures: Vec<ChunkFailure> },

    #[error("Analysis cancelled")]
    Cancelled,

    /// Loading the transcript or rubric failed.
    #[error("Failed to load analysis inputs: {0:#}")]
    Input(#[source] anyhow::Error),
}

fn first_reason(failures: &[ChunkFailure]) -> String {
    failures
        .first()
        .map(|f| format!(" (first: {})", f.reason))
        .unwrap_or_default()
}

impl AnalysisError {
    pub fn input(e: impl Into<anyhow::Error>) -> Self {
        Self::Input(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(LlmError::from_status(429, "slow down").is_retryable());
        assert!(LlmError::from_status(503, "").is_retryable());
        assert!(LlmError::from_status(529, "overloaded").is_retryable());
        assert!(!LlmError::from_status(400, "bad").is_retryable());
        assert!(!LlmError::from_status(401, "key").is_retryable());
    }

    #[test]
    fn test_timeout_and_malformed_retryable() {
        assert!(LlmError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(LlmError::malformed("not json").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = LlmError::from_status(429, "rate limited");
        assert_eq!(
            err.to_string(),
            "Transient LLM failure (HTTP 429): rate limited"
        );
        assert_eq!(
            LlmError::transient("reset").to_string(),
            "Transient LLM failure: reset"
        );
    }

    #[test]
    fn test_all_chunks_failed_display() {
        let err = AnalysisError::AllChunksFailed {
            failures: vec![
                ChunkFailure {
                    chunk_index: 0,
                    attempts: 3,
                    reason: "timeout".to_string(),
                },
                ChunkFailure {
                    chunk_index: 1,
                    attempts: 3,
                    reason: "429".to_string(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "All 2 chunk calls failed (first: timeout)"
        );
    }

    #[test]
    fn test_long_body_truncated() {
        let body = "x".repeat(2000);
        let LlmError::Permanent { message, .. } = LlmError::from_status(400, &body) else {
            panic!("expected permanent");
        };
        assert!(message.chars().count() <= 501);
    }
}
