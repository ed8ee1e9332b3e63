//! Core data models used throughout Scorecard.
//!
//! These types represent call transcripts, the per-chunk findings returned by
//! the completion service, and the merged per-dimension [`AnalysisResult`]
//! that is cached and handed back to callers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single speaker-tagged utterance in a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utterance {
    pub speaker: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

/// An ingested call transcript. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub call_id: String,
    pub utterances: Vec<Utterance>,
}

/// The transcript rendered to the line format sent to the model, plus the
/// byte span `[start, end)` of each utterance's line.
#[derive(Debug, Clone)]
pub struct RenderedTranscript {
    pub text: String,
    pub spans: Vec<(usize, usize)>,
}

impl Transcript {
    pub fn new(call_id: impl Into<String>, utterances: Vec<Utterance>) -> Self {
        Self {
            call_id: call_id.into(),
            utterances,
        }
    }

    /// True when there is no utterance with non-whitespace text.
    pub fn is_blank(&self) -> bool {
        self.utterances.iter().all(|u| u.text.trim().is_empty())
    }

    /// Render every utterance as `[#<index> @ mm:ss] <speaker>: <text>\n`.
    ///
    /// The index prefix is what the model cites back in findings.
    pub fn render(&self) -> RenderedTranscript {
        let mut text = String::new();
        let mut spans = Vec::with_capacity(self.utterances.len());
        for (i, u) in self.utterances.iter().enumerate() {
            let start = text.len();
            text.push_str(&format!(
                "[#{} @ {}] {}: {}\n",
                i,
                format_offset(u.start_ms),
                u.speaker,
                u.text
            ));
            spans.push((start, text.len()));
        }
        RenderedTranscript { text, spans }
    }
}

/// Format a millisecond offset as `mm:ss`.
pub fn format_offset(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// One qualitative observation tied to an utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Rubric criterion this finding is about (e.g. `"open_questions"`).
    pub criterion: String,
    /// Index of the cited utterance in the transcript.
    pub utterance_index: usize,
    /// Start offset of the cited utterance, filled from the transcript.
    #[serde(default)]
    pub timestamp_ms: u64,
    pub observation: String,
    /// Quoted utterance text. Stripped when snippets are not requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Structured output of one completion call over one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFindings {
    /// Overall dimension score for this chunk, on the rubric's scale.
    pub score: f64,
    /// Per-criterion scores.
    #[serde(default)]
    pub criteria: BTreeMap<String, f64>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Whether every chunk contributed to a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Complete,
    Partial,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Complete => "complete",
            ResultStatus::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "complete" => Some(ResultStatus::Complete),
            "partial" => Some(ResultStatus::Partial),
            _ => None,
        }
    }
}

/// A chunk whose completion calls all failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub attempts: u32,
    pub reason: String,
}

/// Scored output for one dimension of one transcript under one rubric version.
///
/// Immutable once written to the cache; a re-analysis produces a new value
/// that supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub dimension: String,
    pub rubric_version: String,
    pub cache_key: String,
    pub content_hash: String,
    pub status: ResultStatus,
    /// Token-weighted average of the per-chunk scores.
    pub score: f64,
    pub criteria: BTreeMap<String, f64>,
    pub findings: Vec<Finding>,
    pub summary: String,
    pub chunk_count: usize,
    #[serde(default)]
    pub failed_chunks: Vec<ChunkFailure>,
}

impl AnalysisResult {
    pub fn is_partial(&self) -> bool {
        self.status == ResultStatus::Partial
    }

    /// Copy of this result with every finding's snippet removed.
    pub fn without_snippets(&self) -> Self {
        let mut out = self.clone();
        for f in &mut out.findings {
            f.snippet = None;
        }
        out
    }
}

/// Per-request knobs for `analyze`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyzeOptions {
    /// Skip the cache lookup and recompute.
    pub force_reanalysis: bool,
    /// Keep quoted utterance text on returned findings.
    pub include_snippets: bool,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            force_reanalysis: false,
            include_snippets: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utt(speaker: &str, start_ms: u64, text: &str) -> Utterance {
        Utterance {
            speaker: speaker.to_string(),
            start_ms,
            end_ms: start_ms + 1000,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_render_spans_cover_text() {
        let t = Transcript::new(
            "call-1",
            vec![utt("Rep", 0, "Hi there."), utt("Buyer", 65_000, "Hello.")],
        );
        let r = t.render();
        assert_eq!(r.spans.len(), 2);
        assert_eq!(r.spans[0].0, 0);
        assert_eq!(r.spans[0].1, r.spans[1].0);
        assert_eq!(r.spans[1].1, r.text.len());
        assert_eq!(&r.text[r.spans[1].0..r.spans[1].1], "[#1 @ 01:05] Buyer: Hello.\n");
    }

    #[test]
    fn test_is_blank() {
        assert!(Transcript::new("c", vec![]).is_blank());
        assert!(Transcript::new("c", vec![utt("Rep", 0, "   ")]).is_blank());
        assert!(!Transcript::new("c", vec![utt("Rep", 0, "ok")]).is_blank());
    }

    #[test]
    fn test_status_roundtrip_str() {
        for s in [ResultStatus::Complete, ResultStatus::Partial] {
            assert_eq!(ResultStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ResultStatus::parse("failed"), None);
    }

    #[test]
    fn test_without_snippets() {
        let r = AnalysisResult {
            dimension: "discovery".into(),
            rubric_version: "v1".into(),
            cache_key: "k".into(),
            content_hash: "h".into(),
            status: ResultStatus::Complete,
            score: 5.0,
            criteria: BTreeMap::new(),
            findings: vec![Finding {
                criterion: "c".into(),
                utterance_index: 0,
                timestamp_ms: 0,
                observation: "o".into(),
                snippet: Some("quote".into()),
            }],
            summary: String::new(),
            chunk_count: 1,
            failed_chunks: vec![],
        };
        let stripped = r.without_snippets();
        assert!(stripped.findings[0].snippet.is_none());
        assert!(r.findings[0].snippet.is_some());
    }
}
