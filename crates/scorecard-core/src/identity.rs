//! Deterministic cache identity for an analysis.
//!
//! A [`CacheKey`] names "this transcript content, analyzed for this
//! dimension, under this rubric version". The transcript is normalized
//! before hashing so formatting-only differences (line endings, runs of
//! spaces, a BOM, non-breaking spaces) hash identically.
//!
//! The key string is `"<dimension>:<sha256 hex>:<rubric_version>"`. The
//! dimension and version are explicit components rather than folded into
//! the digest, so bumping a rubric version always changes the key visibly.
//! `%` and `:` inside those two components are percent-escaped to keep the
//! rendering injective.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::models::Transcript;

/// SHA-256 of normalized transcript content, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of_transcript(transcript: &Transcript) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_transcript(transcript).as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite identity `(dimension, content hash, rubric version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    dimension: String,
    content_hash: ContentHash,
    rubric_version: String,
    rendered: String,
}

impl CacheKey {
    pub fn new(dimension: &str, content_hash: ContentHash, rubric_version: &str) -> Self {
        let rendered = format!(
            "{}:{}:{}",
            escape_component(dimension),
            content_hash.as_str(),
            escape_component(rubric_version)
        );
        Self {
            dimension: dimension.to_string(),
            content_hash,
            rubric_version: rubric_version.to_string(),
            rendered,
        }
    }

    pub fn dimension(&self) -> &str {
        &self.dimension
    }

    pub fn content_hash(&self) -> &ContentHash {
        &self.content_hash
    }

    pub fn rubric_version(&self) -> &str {
        &self.rubric_version
    }

    /// The stable key string used by both cache tiers.
    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

/// Derive the cache key for analyzing `transcript` along `dimension` under
/// `rubric_version`. Pure: equal inputs give equal keys in every process.
pub fn derive_key(dimension: &str, transcript: &Transcript, rubric_version: &str) -> CacheKey {
    CacheKey::new(
        dimension,
        ContentHash::of_transcript(transcript),
        rubric_version,
    )
}

/// Canonical text form of a transcript used for hashing.
///
/// One line per utterance: `speaker \t start_ms \t end_ms \t text`, each
/// field passed through [`normalize_text`]. The call id is not part of the
/// content, so identical transcripts under different ids share a hash.
pub fn normalize_transcript(transcript: &Transcript) -> String {
    let mut out = String::new();
    for u in &transcript.utterances {
        out.push_str(&normalize_text(&u.speaker));
        out.push('\t');
        out.push_str(&u.start_ms.to_string());
        out.push('\t');
        out.push_str(&u.end_ms.to_string());
        out.push('\t');
        out.push_str(&normalize_text(&u.text));
        out.push('\n');
    }
    out
}

/// Trim, drop a BOM, unify line endings and collapse whitespace runs
/// (including non-breaking and other Unicode spaces) to a single space.
pub fn normalize_text(s: &str) -> String {
    let s = s.strip_prefix('\u{feff}').unwrap_or(s);
    let unified = s.replace("\r\n", "\n").replace('\r', "\n");
    unified
        .split(|c: char| c.is_whitespace() || c == '\u{200b}')
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn escape_component(s: &str) -> String {
    s.replace('%', "%25").replace(':', "%3A")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Utterance;

    fn transcript(texts: &[&str]) -> Transcript {
        Transcript::new(
            "call-1",
            texts
                .iter()
                .enumerate()
                .map(|(i, t)| Utterance {
                    speaker: "Rep".to_string(),
                    start_ms: i as u64 * 1000,
                    end_ms: i as u64 * 1000 + 900,
                    text: t.to_string(),
                })
                .collect(),
        )
    }

    #[test]
    fn test_key_is_deterministic() {
        let t = transcript(&["Hello there.", "How are you?"]);
        let a = derive_key("discovery", &t, "v1");
        let b = derive_key("discovery", &t.clone(), "v1");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), b.as_str());
    }

    #[test]
    fn test_key_layout() {
        let t = transcript(&["Hello"]);
        let k = derive_key("discovery", &t, "v3");
        let parts: Vec<&str> = k.as_str().split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "discovery");
        assert_eq!(parts[1].len(), 64);
        assert_eq!(parts[2], "v3");
    }

    #[test]
    fn test_version_change_changes_key() {
        let t = transcript(&["Hello"]);
        assert_ne!(
            derive_key("discovery", &t, "v1").as_str(),
            derive_key("discovery", &t, "v2").as_str()
        );
    }

    #[test]
    fn test_dimension_change_changes_key() {
        let t = transcript(&["Hello"]);
        assert_ne!(
            derive_key("discovery", &t, "v1"),
            derive_key("objection_handling", &t, "v1")
        );
    }

    #[test]
    fn test_formatting_only_changes_share_hash() {
        let a = transcript(&["Hello   there.\r\nHow are you?"]);
        let b = transcript(&["\u{feff}Hello there.\nHow\u{00a0}are you?  "]);
        assert_eq!(ContentHash::of_transcript(&a), ContentHash::of_transcript(&b));
    }

    #[test]
    fn test_content_change_changes_hash() {
        let a = transcript(&["Hello there."]);
        let b = transcript(&["Hello there!"]);
        assert_ne!(ContentHash::of_transcript(&a), ContentHash::of_transcript(&b));
    }

    #[test]
    fn test_call_id_not_part_of_content() {
        let a = transcript(&["Same words."]);
        let mut b = a.clone();
        b.call_id = "call-2".to_string();
        assert_eq!(ContentHash::of_transcript(&a), ContentHash::of_transcript(&b));
    }

    #[test]
    fn test_separator_in_components_does_not_collide() {
        let t = transcript(&["x"]);
        let h = ContentHash::of_transcript(&t);
        let a = CacheKey::new("a:b", h.clone(), "c");
        let b = CacheKey::new("a", h, "b:c");
        assert_ne!(a.as_str(), b.as_str());
        assert!(a.as_str().starts_with("a%3Ab:"));
    }
}
