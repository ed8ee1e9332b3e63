//! Prompt assembly and response parsing for chunk calls.
//!
//! A chunk prompt is an ordered list of [`PromptSegment`]s: fixed
//! instructions, the dimension's rubric, its knowledge-base excerpts, and
//! finally the transcript chunk. The first three are identical for every
//! chunk of every call scored against the same rubric version; the advisor
//! decides which of them carry cache hints.

use scorecard_core::advisor::{CachePlan, PromptSegment, SegmentKind};
use scorecard_core::chunk::TranscriptChunk;
use scorecard_core::models::ChunkFindings;

use crate::error::LlmError;
use crate::llm::{CompletionRequest, PromptBlock};
use crate::rubric::Rubric;

const INSTRUCTIONS: &str = "\
You are a sales coach scoring one dimension of a recorded call.
Score only against the rubric below. Each transcript line starts with
[#<index> @ mm:ss]; cite lines by that index.

Reply with a single JSON object and nothing else:
{
  \"score\": <number, the rubric's overall scale>,
  \"criteria\": { \"<criterion>\": <number>, ... },
  \"findings\": [
    { \"criterion\": \"<criterion>\", \"utterance_index\": <index>, \"observation\": \"<one sentence>\" }
  ],
  \"summary\": \"<two sentences at most>\"
}

You may be shown one excerpt of a longer call. Judge only what the excerpt
shows. Lines before the marked continuation point repeat the end of the
previous excerpt for context; do not cite them unless the excerpt changes
their meaning.";

/// Build the ordered prompt segments for one chunk.
pub fn build_segments(
    rubric: &Rubric,
    chunk: &TranscriptChunk,
    total_chunks: usize,
) -> Vec<PromptSegment> {
    let mut segments = vec![
        PromptSegment::new(SegmentKind::Instructions, INSTRUCTIONS),
        PromptSegment::new(
            SegmentKind::Rubric,
            format!(
                "Dimension: {}\nRubric version: {}\n\n{}",
                rubric.dimension, rubric.version, rubric.text
            ),
        ),
    ];
    for kb in &rubric.knowledge {
        segments.push(PromptSegment::new(SegmentKind::KnowledgeBase, kb.clone()));
    }
    segments.push(PromptSegment::new(
        SegmentKind::Transcript,
        render_chunk(chunk, total_chunks),
    ));
    segments
}

fn render_chunk(chunk: &TranscriptChunk, total_chunks: usize) -> String {
    if total_chunks <= 1 {
        return format!("Transcript:\n\n{}", chunk.text);
    }
    let overlap_len = chunk.overlap_end_byte - chunk.start_byte;
    let (context, fresh) = chunk.text.split_at(overlap_len);
    let mut out = format!(
        "Transcript excerpt {} of {} (lines #{} to #{}):\n\n",
        chunk.index + 1,
        total_chunks,
        chunk.first_utterance,
        chunk.last_utterance
    );
    if !context.is_empty() {
        out.push_str(context);
        out.push_str("\n--- continuation point ---\n");
    }
    out.push_str(fresh);
    out
}

/// Turn segments plus cache advice into a request.
///
/// Stable segments become system blocks; a block carries a hint when the
/// advice places a breakpoint on it. Transcript segments form the user turn.
pub fn build_request(
    segments: &[PromptSegment],
    plan: &CachePlan,
    max_output_tokens: u32,
) -> CompletionRequest {
    let mut system = Vec::new();
    let mut user = Vec::new();
    for (segment, advice) in segments.iter().zip(&plan.segments) {
        if segment.kind.is_stable() {
            system.push(PromptBlock {
                kind: segment.kind,
                text: segment.text.clone(),
                cache_hint: advice.breakpoint,
            });
        } else {
            user.push(segment.text.as_str());
        }
    }
    CompletionRequest {
        system,
        user: user.join("\n\n"),
        max_output_tokens,
    }
}

/// Parse the model's reply into chunk findings.
///
/// Tolerates Markdown code fences and prose around the JSON object.
pub fn parse_chunk_findings(text: &str) -> Result<ChunkFindings, LlmError> {
    let start = text
        .find('{')
        .ok_or_else(|| LlmError::malformed("no JSON object in response"))?;
    let end = text
        .rfind('}')
        .filter(|&e| e > start)
        .ok_or_else(|| LlmError::malformed("unterminated JSON object in response"))?;

    let findings: ChunkFindings = serde_json::from_str(&text[start..=end])
        .map_err(|e| LlmError::malformed(format!("invalid findings JSON: {}", e)))?;

    if !findings.score.is_finite() || findings.criteria.values().any(|v| !v.is_finite()) {
        return Err(LlmError::malformed("non-finite score"));
    }
    Ok(findings)
}
