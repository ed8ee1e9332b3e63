//! Prompt-segment cache advisor.
//!
//! Providers that support prompt caching reuse a request *prefix* up to a
//! marked breakpoint. The advisor looks at the ordered segments of a prompt
//! and decides which ones are stable across many calls (instructions,
//! rubric, knowledge base) and can sit behind a breakpoint, and which are
//! unique per call (the transcript chunk).
//!
//! # Rules
//!
//! - Only the leading run of stable segments is cacheable; a stable segment
//!   placed after per-call content can never be part of a reused prefix.
//! - The cacheable prefix must reach `min_cacheable_tokens`, otherwise no
//!   breakpoint is placed (providers ignore or reject tiny prefixes).
//! - Breakpoints go on the last segment of each stable kind within the
//!   prefix, keeping the last `max_breakpoints` of them; the final segment
//!   of the prefix always carries one.
//! - When the provider does not support hints, nothing is marked and calls
//!   proceed at full price.
//!
//! This is a cost optimization only. It never changes what is sent, only
//! which segments carry a hint.

use serde::Serialize;

use crate::tokenize::Tokenizer;

/// What a prompt segment contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Instructions,
    Rubric,
    KnowledgeBase,
    Transcript,
}

impl SegmentKind {
    /// Stable segments are identical across calls for the same rubric.
    pub fn is_stable(self) -> bool {
        !matches!(self, SegmentKind::Transcript)
    }
}

/// One ordered piece of a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSegment {
    pub kind: SegmentKind,
    pub text: String,
}

impl PromptSegment {
    pub fn new(kind: SegmentKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// What the target provider accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheCapabilities {
    pub supports_hints: bool,
    pub max_breakpoints: usize,
    pub min_cacheable_tokens: usize,
}

impl CacheCapabilities {
    pub fn unsupported() -> Self {
        Self {
            supports_hints: false,
            max_breakpoints: 0,
            min_cacheable_tokens: 0,
        }
    }
}

/// Advice for one segment, in prompt order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentAdvice {
    pub kind: SegmentKind,
    /// Segment lies inside a prefix the provider can reuse.
    pub cacheable: bool,
    /// Attach a cache hint to this segment.
    pub breakpoint: bool,
    pub tokens: usize,
}

/// Advice for a whole prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachePlan {
    pub segments: Vec<SegmentAdvice>,
    /// Tokens in the cacheable prefix (0 if nothing is marked).
    pub cacheable_tokens: usize,
}

impl CachePlan {
    pub fn breakpoints(&self) -> usize {
        self.segments.iter().filter(|s| s.breakpoint).count()
    }
}

/// Decide which segments to mark for provider-side reuse.
pub fn advise(
    segments: &[PromptSegment],
    tokenizer: &dyn Tokenizer,
    caps: &CacheCapabilities,
) -> CachePlan {
    let mut advice: Vec<SegmentAdvice> = segments
        .iter()
        .map(|s| SegmentAdvice {
            kind: s.kind,
            cacheable: false,
            breakpoint: false,
            tokens: tokenizer.count_tokens(&s.text),
        })
        .collect();

    if !caps.supports_hints || caps.max_breakpoints == 0 {
        return CachePlan {
            segments: advice,
            cacheable_tokens: 0,
        };
    }

    let prefix_len = segments
        .iter()
        .position(|s| !s.kind.is_stable())
        .unwrap_or(segments.len());
    let prefix_tokens: usize = advice[..prefix_len].iter().map(|a| a.tokens).sum();

    if prefix_len == 0 || prefix_tokens < caps.min_cacheable_tokens.max(1) {
        return CachePlan {
            segments: advice,
            cacheable_tokens: 0,
        };
    }

    // Last index of each kind run within the prefix.
    let mut boundaries: Vec<usize> = (0..prefix_len)
        .filter(|&i| i + 1 == prefix_len || segments[i + 1].kind != segments[i].kind)
        .collect();
    if boundaries.len() > caps.max_breakpoints {
        boundaries.drain(..boundaries.len() - caps.max_breakpoints);
    }

    for a in &mut advice[..prefix_len] {
        a.cacheable = true;
    }
    for i in boundaries {
        advice[i].breakpoint = true;
    }

    CachePlan {
        segments: advice,
        cacheable_tokens: prefix_tokens,
    }
}
