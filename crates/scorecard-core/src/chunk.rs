//! Token-bounded, overlapping transcript chunker.
//!
//! Splits a rendered [`Transcript`] into [`TranscriptChunk`]s that fit a
//! model's context budget. Consecutive chunks share a leading overlap so the
//! model sees context across chunk boundaries.
//!
//! # Algorithm
//!
//! 1. Render the transcript and tokenize it with the supplied [`Tokenizer`].
//! 2. If the whole stream fits in `max_tokens`, emit one chunk with no overlap.
//! 3. Otherwise slide a `max_tokens` window over the token stream, starting
//!    windows at `0, step, 2·step, …` while the start is inside the stream,
//!    where `step = max_tokens − overlap_tokens`.
//! 4. Each window maps back to a byte range of the rendered text: a window
//!    starts at its first token's offset (byte 0 for the first window) and
//!    ends where the next token outside the window starts (or at the end of
//!    the text), so inter-token whitespace is never lost.
//!
//! # Example
//!
//! ```rust
//! use scorecard_core::chunk::{chunk_transcript, reconstruct, ChunkPlan};
//! use scorecard_core::models::{Transcript, Utterance};
//! use scorecard_core::tokenize::WordTokenizer;
//!
//! let t = Transcript::new("call-1", vec![Utterance {
//!     speaker: "Rep".into(), start_ms: 0, end_ms: 900, text: "Thanks for joining.".into(),
//! }]);
//! let chunks = chunk_transcript(&t, &WordTokenizer, &ChunkPlan::new(700, 0.2, 32));
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(reconstruct(&chunks), t.render().text);
//! ```

use serde::Serialize;

use crate::models::Transcript;
use crate::tokenize::Tokenizer;

/// Smallest `max_tokens` the chunker accepts.
pub const MIN_CHUNK_TOKENS: usize = 16;

/// Chunk sizing parameters, decoupled from application config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkPlan {
    pub max_tokens: usize,
    /// Fraction of `max_tokens` shared with the previous chunk.
    pub overlap_fraction: f64,
    /// Lower bound on the overlap, in tokens.
    pub min_overlap_tokens: usize,
}

impl ChunkPlan {
    pub fn new(max_tokens: usize, overlap_fraction: f64, min_overlap_tokens: usize) -> Self {
        Self {
            max_tokens,
            overlap_fraction,
            min_overlap_tokens,
        }
    }

    /// Overlap in tokens: the configured fraction, raised to the minimum and
    /// clamped so the window always advances.
    pub fn overlap_tokens(&self) -> usize {
        let max = self.max_tokens.max(1);
        let by_fraction = (max as f64 * self.overlap_fraction).round() as usize;
        by_fraction.max(self.min_overlap_tokens).min(max - 1)
    }

    /// Distance in tokens between consecutive window starts.
    pub fn step(&self) -> usize {
        self.max_tokens.max(1) - self.overlap_tokens()
    }
}

/// A contiguous, token-bounded slice of a rendered transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptChunk {
    /// Sequence index, contiguous from 0.
    pub index: usize,
    pub text: String,
    /// Byte range `[start_byte, end_byte)` in the rendered transcript.
    pub start_byte: usize,
    pub end_byte: usize,
    /// Token range `[start_token, end_token)`.
    pub start_token: usize,
    pub end_token: usize,
    /// Tokens at the start of this chunk already covered by earlier chunks.
    pub overlap_tokens: usize,
    /// End of the leading overlap region, `start_byte ..= end_byte`.
    pub overlap_end_byte: usize,
    /// First and last utterance (inclusive) touched by this chunk.
    pub first_utterance: usize,
    pub last_utterance: usize,
}

impl TranscriptChunk {
    pub fn token_count(&self) -> usize {
        self.end_token - self.start_token
    }

    /// Tokens this chunk contributes beyond its leading overlap. Used as the
    /// chunk's weight when averaging scores.
    pub fn weight(&self) -> usize {
        self.token_count() - self.overlap_tokens
    }

    /// True when the utterance with byte span `span` begins inside this
    /// chunk's leading overlap, i.e. the chunk lacks its preceding context.
    pub fn starts_in_overlap(&self, span: (usize, usize)) -> bool {
        span.0 < self.overlap_end_byte
    }

    /// True when the utterance with byte span `span` begins in this chunk's
    /// fresh region, so the chunk carries everything that preceded it.
    pub fn has_full_context(&self, span: (usize, usize)) -> bool {
        span.0 >= self.overlap_end_byte && span.0 < self.end_byte
    }

    /// The part of `text` not already covered by earlier chunks.
    pub fn fresh_text(&self) -> &str {
        &self.text[self.overlap_end_byte - self.start_byte..]
    }
}

/// Split a transcript into overlapping, token-bounded chunks.
///
/// # Guarantees
///
/// - A blank transcript (no tokens) yields no chunks.
/// - A transcript of at most `max_tokens` tokens yields exactly one chunk
///   spanning the whole rendered text.
/// - No chunk is empty, and chunk indices are contiguous from 0.
/// - [`reconstruct`] over the result returns the rendered text exactly.
pub fn chunk_transcript(
    transcript: &Transcript,
    tokenizer: &dyn Tokenizer,
    plan: &ChunkPlan,
) -> Vec<TranscriptChunk> {
    let rendered = transcript.render();
    let text = rendered.text.as_str();
    let starts = tokenizer.token_starts(text);
    let total = starts.len();

    if total == 0 {
        return Vec::new();
    }

    let max = plan.max_tokens.max(1);
    let byte_at = |token: usize| -> usize {
        if token == 0 {
            0
        } else if token >= total {
            text.len()
        } else {
            starts[token]
        }
    };

    let windows: Vec<(usize, usize)> = if total <= max {
        vec![(0, total)]
    } else {
        let step = plan.step();
        (0..total)
            .step_by(step)
            .map(|s| (s, (s + max).min(total)))
            .collect()
    };

    let mut chunks = Vec::with_capacity(windows.len());
    let mut covered_to = 0usize;

    for (index, (start_token, end_token)) in windows.into_iter().enumerate() {
        let start_byte = byte_at(start_token);
        let end_byte = byte_at(end_token);
        let overlap_end_token = covered_to.clamp(start_token, end_token);
        let overlap_end_byte = byte_at(overlap_end_token).clamp(start_byte, end_byte);

        let first_utterance = rendered
            .spans
            .partition_point(|&(_, end)| end <= start_byte)
            .min(rendered.spans.len().saturating_sub(1));
        let last_utterance = rendered
            .spans
            .partition_point(|&(start, _)| start < end_byte)
            .saturating_sub(1)
            .max(first_utterance);

        chunks.push(TranscriptChunk {
            index,
            text: text[start_byte..end_byte].to_string(),
            start_byte,
            end_byte,
            start_token,
            end_token,
            overlap_tokens: overlap_end_token - start_token,
            overlap_end_byte,
            first_utterance,
            last_utterance,
        });
        covered_to = covered_to.max(end_token);
    }

    chunks
}

/// Reassemble chunk text, dropping each chunk's leading overlap.
pub fn reconstruct(chunks: &[TranscriptChunk]) -> String {
    let mut out = String::new();
    for c in chunks {
        out.push_str(c.fresh_text());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Utterance;
    use crate::tokenize::WordTokenizer;

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    /// Transcript of `n_utts` utterances, each `10 + words_per` tokens.
    fn transcript(n_utts: usize, words_per: usize) -> Transcript {
        let utterances = (0..n_utts)
            .map(|i| Utterance {
                speaker: if i % 2 == 0 { "Rep" } else { "Buyer" }.to_string(),
                start_ms: i as u64 * 4_000,
                end_ms: i as u64 * 4_000 + 3_500,
                text: words(words_per),
            })
            .collect();
        Transcript::new("call-1", utterances)
    }

    fn plan(max: usize) -> ChunkPlan {
        ChunkPlan::new(max, 0.2, 0)
    }

    #[test]
    fn test_overlap_and_step() {
        let p = ChunkPlan::new(80_000, 0.2, 32);
        assert_eq!(p.overlap_tokens(), 16_000);
        assert_eq!(p.step(), 64_000);

        // Minimum applies when the fraction is too small.
        let p = ChunkPlan::new(100, 0.2, 32);
        assert_eq!(p.overlap_tokens(), 32);

        // Never stalls.
        let p = ChunkPlan::new(20, 0.9, 0);
        assert_eq!(p.step(), 2);
        let p = ChunkPlan::new(20, 0.2, 500);
        assert_eq!(p.step(), 1);
    }

    #[test]
    fn test_empty_transcript_yields_no_chunks() {
        let t = Transcript::new("c", vec![]);
        assert!(chunk_transcript(&t, &WordTokenizer, &plan(100)).is_empty());
    }

    #[test]
    fn test_small_transcript_single_chunk() {
        let t = transcript(3, 5);
        let chunks = chunk_transcript(&t, &WordTokenizer, &plan(700));
        assert_eq!(chunks.len(), 1);
        let c = &chunks[0];
        assert_eq!(c.text, t.render().text);
        assert_eq!(c.overlap_tokens, 0);
        assert_eq!(c.first_utterance, 0);
        assert_eq!(c.last_utterance, 2);
    }

    #[test]
    fn test_exactly_max_tokens_is_one_chunk() {
        let t = transcript(4, 15); // 4 × 25 = 100 tokens
        assert_eq!(WordTokenizer.count_tokens(&t.render().text), 100);
        assert_eq!(chunk_transcript(&t, &WordTokenizer, &plan(100)).len(), 1);
    }

    #[test]
    fn test_max_plus_one_is_at_least_two_chunks() {
        let mut t = transcript(4, 15);
        t.utterances[3].text.push_str(" extra");
        assert_eq!(WordTokenizer.count_tokens(&t.render().text), 101);
        let chunks = chunk_transcript(&t, &WordTokenizer, &plan(100));
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.token_count() > 0));
    }

    #[test]
    fn test_windows_advance_by_step() {
        let t = transcript(40, 15); // 1000 tokens
        let p = plan(100);
        let chunks = chunk_transcript(&t, &WordTokenizer, &p);
        assert_eq!(p.step(), 80);
        assert_eq!(chunks.len(), 13); // starts 0, 80, …, 960
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            assert_eq!(c.start_token, i * 80);
            assert!(c.token_count() <= 100);
            if i > 0 {
                assert_eq!(c.overlap_tokens, 20.min(c.token_count()));
            }
        }
        assert_eq!(chunks.last().unwrap().end_token, 1000);
    }

    #[test]
    fn test_exact_multiple_of_step_has_no_empty_tail() {
        let t = transcript(16, 15); // 400 tokens = 5 × 80
        let chunks = chunk_transcript(&t, &WordTokenizer, &plan(100));
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| !c.text.is_empty() && c.token_count() > 0));
        assert_eq!(chunks.last().unwrap().end_token, 400);
    }

    #[test]
    fn test_reconstruct_is_exact() {
        for max in [16, 17, 50, 99, 100, 333] {
            let t = transcript(37, 11);
            let chunks = chunk_transcript(&t, &WordTokenizer, &ChunkPlan::new(max, 0.2, 4));
            assert_eq!(reconstruct(&chunks), t.render().text, "max_tokens={}", max);
        }
    }

    #[test]
    fn test_utterance_ranges_and_overlap_region() {
        let t = transcript(10, 15); // 25 tokens per utterance
        let rendered = t.render();
        let chunks = chunk_transcript(&t, &WordTokenizer, &plan(50));
        // step 40, overlap 10
        assert_eq!(chunks[1].start_token, 40);
        assert_eq!(chunks[1].first_utterance, 1);
        assert_eq!(chunks[1].last_utterance, 3);
        // Utterance 1 begins before chunk 1 starts: no preceding context.
        assert!(chunks[1].starts_in_overlap(rendered.spans[1]));
        // Utterance 2 begins at token 50, past the overlap (tokens 40..50).
        assert!(!chunks[1].starts_in_overlap(rendered.spans[2]));
        assert!(!chunks[0].starts_in_overlap(rendered.spans[1]));
        assert!(chunks[0].has_full_context(rendered.spans[1]));
        assert!(!chunks[1].has_full_context(rendered.spans[1]));
        assert!(chunks[1].has_full_context(rendered.spans[2]));
        // Utterance 5 is outside chunk 1 entirely.
        assert!(!chunks[1].has_full_context(rendered.spans[5]));
    }

    #[test]
    fn test_weights_sum_to_total_tokens() {
        let t = transcript(33, 7);
        let total = WordTokenizer.count_tokens(&t.render().text);
        let chunks = chunk_transcript(&t, &WordTokenizer, &ChunkPlan::new(64, 0.25, 0));
        let weight: usize = chunks.iter().map(|c| c.weight()).sum();
        assert_eq!(weight, total);
    }

    #[test]
    fn test_deterministic() {
        let t = transcript(20, 9);
        let a = chunk_transcript(&t, &WordTokenizer, &plan(40));
        let b = chunk_transcript(&t, &WordTokenizer, &plan(40));
        assert_eq!(a, b);
    }
}
