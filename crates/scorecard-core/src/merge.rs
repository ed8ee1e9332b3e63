//! Merging per-chunk findings into one dimension result.
//!
//! # Merge Policy
//!
//! 1. Chunk results are ordered by chunk index, never by arrival order.
//! 2. Findings citing an utterance that does not exist are dropped; the rest
//!    are anchored to the transcript (timestamp and quoted text are filled
//!    from the cited utterance, not trusted from the model).
//! 3. Duplicates, i.e. findings with the same criterion citing the same
//!    utterance, are reduced to one copy. The copy from a chunk in which the
//!    utterance begins in the fresh, non-overlap region (so the model saw
//!    its preceding context) wins; among equals the earliest chunk wins.
//! 4. Survivors are emitted in chunk order, then in the order the model
//!    listed them.
//! 5. The overall score and each criterion score are averages weighted by
//!    each chunk's non-overlap token count. If every weight is zero the plain
//!    mean is used.
//!
//! The output depends only on the set of `(chunk index, findings)` pairs, so
//! it is identical regardless of the order in which chunk calls complete.

use std::collections::{BTreeMap, HashMap};

use crate::chunk::TranscriptChunk;
use crate::models::{ChunkFindings, Finding, Transcript};

/// Result of merging the successful chunks of one analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedFindings {
    pub score: f64,
    pub criteria: BTreeMap<String, f64>,
    pub findings: Vec<Finding>,
    pub summary: String,
    /// Indices of the chunks that contributed, ascending.
    pub merged_chunks: Vec<usize>,
    /// Findings discarded for citing a non-existent utterance.
    pub dropped_findings: usize,
}

/// Merge chunk results. `results` pairs a chunk index with its findings and
/// may be in any order; indices without a matching chunk are ignored.
pub fn merge_chunk_findings(
    transcript: &Transcript,
    chunks: &[TranscriptChunk],
    results: &[(usize, ChunkFindings)],
) -> MergedFindings {
    let spans = transcript.render().spans;

    let mut ordered: Vec<(&TranscriptChunk, &ChunkFindings)> = results
        .iter()
        .filter_map(|(idx, f)| chunks.get(*idx).map(|c| (c, f)))
        .collect();
    ordered.sort_by_key(|(c, _)| c.index);
    ordered.dedup_by_key(|(c, _)| c.index);

    struct Candidate {
        chunk: usize,
        position: usize,
        has_context: bool,
        finding: Finding,
    }

    let mut dropped = 0usize;
    let mut best: HashMap<(String, usize), Candidate> = HashMap::new();

    for (chunk, chunk_findings) in &ordered {
        for (position, f) in chunk_findings.findings.iter().enumerate() {
            let Some(utterance) = transcript.utterances.get(f.utterance_index) else {
                dropped += 1;
                continue;
            };
            let mut finding = f.clone();
            finding.timestamp_ms = utterance.start_ms;
            finding.snippet = Some(utterance.text.clone());

            let candidate = Candidate {
                chunk: chunk.index,
                position,
                has_context: chunk.has_full_context(spans[f.utterance_index]),
                finding,
            };
            let key = (normalize_criterion(&f.criterion), f.utterance_index);
            match best.get(&key) {
                Some(existing) if existing.has_context || !candidate.has_context => {}
                _ => {
                    best.insert(key, candidate);
                }
            }
        }
    }

    let mut survivors: Vec<Candidate> = best.into_values().collect();
    survivors.sort_by_key(|c| (c.chunk, c.position));

    let weights: Vec<f64> = ordered.iter().map(|(c, _)| c.weight() as f64).collect();
    let use_weights = weights.iter().any(|w| *w > 0.0);
    let weight_of = |i: usize| if use_weights { weights[i] } else { 1.0 };

    let mut score_num = 0.0;
    let mut score_den = 0.0;
    let mut crit_acc: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for (i, (_, f)) in ordered.iter().enumerate() {
        let w = weight_of(i);
        score_num += w * f.score;
        score_den += w;
        for (name, value) in &f.criteria {
            let acc = crit_acc.entry(name.clone()).or_insert((0.0, 0.0));
            acc.0 += w * value;
            acc.1 += w;
        }
    }

    let criteria = crit_acc
        .into_iter()
        .map(|(name, (num, den))| (name, if den > 0.0 { num / den } else { 0.0 }))
        .collect();

    let summary = ordered
        .iter()
        .filter_map(|(_, f)| f.summary.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    MergedFindings {
        score: if score_den > 0.0 { score_num / score_den } else { 0.0 },
        criteria,
        findings: survivors.into_iter().map(|c| c.finding).collect(),
        summary,
        merged_chunks: ordered.iter().map(|(c, _)| c.index).collect(),
        dropped_findings: dropped,
    }
}

fn normalize_criterion(s: &str) -> String {
    s.trim().to_lowercase()
}
