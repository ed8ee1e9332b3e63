//! Tokenizer selection.
//!
//! `chunking.tokenizer = "word"` uses the built-in [`WordTokenizer`]; any
//! other value is a path to a HuggingFace `tokenizer.json` for model-exact
//! counts (requires the `hf-tokenizer` feature).

use anyhow::Result;
use std::sync::Arc;

use scorecard_core::tokenize::{Tokenizer, WordTokenizer};

/// Resolve the configured tokenizer.
pub fn load_tokenizer(spec: &str) -> Result<Arc<dyn Tokenizer>> {
    if spec.is_empty() || spec == "word" {
        return Ok(Arc::new(WordTokenizer));
    }
    load_file(spec)
}

#[cfg(feature = "hf-tokenizer")]
fn load_file(path: &str) -> Result<Arc<dyn Tokenizer>> {
    Ok(Arc::new(HfTokenizer::from_file(path)?))
}

#[cfg(not(feature = "hf-tokenizer"))]
fn load_file(path: &str) -> Result<Arc<dyn Tokenizer>> {
    anyhow::bail!(
        "Tokenizer file '{}' requires the hf-tokenizer feature; use tokenizer = \"word\"",
        path
    )
}

/// Tokenizer backed by a `tokenizer.json`.
#[cfg(feature = "hf-tokenizer")]
pub struct HfTokenizer {
    name: String,
    inner: tokenizers::Tokenizer,
}

#[cfg(feature = "hf-tokenizer")]
impl HfTokenizer {
    pub fn from_file(path: &str) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("Load tokenizer {}: {}", path, e))?;
        Ok(Self {
            name: format!("hf:{}", path),
            inner,
        })
    }
}

#[cfg(feature = "hf-tokenizer")]
impl Tokenizer for HfTokenizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn token_starts(&self, text: &str) -> Vec<usize> {
        let encoding = match self.inner.encode(text, false) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "tokenizer failed, falling back to word counts");
                return WordTokenizer.token_starts(text);
            }
        };

        // Byte-level BPE can emit several tokens for one multi-byte char;
        // keep one start per char boundary.
        let mut starts: Vec<usize> = Vec::with_capacity(encoding.len());
        for &(start, _) in encoding.get_offsets() {
            if start >= text.len() || !text.is_char_boundary(start) {
                continue;
            }
            if starts.last().map_or(true, |&last| start > last) {
                starts.push(start);
            }
        }
        starts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_is_default() {
        assert_eq!(load_tokenizer("word").unwrap().name(), "word");
        assert_eq!(load_tokenizer("").unwrap().name(), "word");
    }

    #[test]
    fn test_missing_file_fails() {
        assert!(load_tokenizer("/nonexistent/tokenizer.json").is_err());
    }

    #[cfg(feature = "hf-tokenizer")]
    mod hf {
        use super::*;
        use scorecard_core::chunk::{chunk_transcript, reconstruct, ChunkPlan};
        use scorecard_core::models::{Transcript, Utterance};

        /// Word-level `tokenizer.json` that knows a handful of words and maps
        /// everything else to `[UNK]`.
        const WORD_LEVEL: &str = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": { "[UNK]": 0, "Rep": 1, "Buyer": 2, "budget": 3, "café": 4 },
                "unk_token": "[UNK]"
            }
        }"#;

        fn write_fixture(dir: &tempfile::TempDir) -> String {
            let path = dir.path().join("tokenizer.json");
            std::fs::write(&path, WORD_LEVEL).unwrap();
            path.to_string_lossy().into_owned()
        }

        fn transcript(n: usize) -> Transcript {
            let utterances = (0..n)
                .map(|i| Utterance {
                    speaker: if i % 2 == 0 { "Rep" } else { "Buyer" }.to_string(),
                    start_ms: i as u64 * 3_000,
                    end_ms: i as u64 * 3_000 + 2_500,
                    text: format!("the budget for café naïve déjà vu item {} … ok", i),
                })
                .collect();
            Transcript::new("call-hf", utterances)
        }

        #[test]
        fn test_loads_tokenizer_file() {
            let dir = tempfile::TempDir::new().unwrap();
            let path = write_fixture(&dir);
            let tokenizer = load_tokenizer(&path).unwrap();
            assert_eq!(tokenizer.name(), format!("hf:{}", path));

            let text = "Rep: café naïve";
            let starts = tokenizer.token_starts(text);
            assert_eq!(starts, vec![0, 3, 5, 11]);
            assert!(starts.iter().all(|&s| text.is_char_boundary(s)));
        }

        #[test]
        fn test_chunks_reconstruct_exactly() {
            let dir = tempfile::TempDir::new().unwrap();
            let tokenizer = load_tokenizer(&write_fixture(&dir)).unwrap();
            let t = transcript(12);

            let chunks = chunk_transcript(&t, tokenizer.as_ref(), &ChunkPlan::new(20, 0.2, 0));
            assert!(chunks.len() > 3);
            assert!(chunks.iter().all(|c| c.token_count() <= 20));
            assert_eq!(reconstruct(&chunks), t.render().text);
        }
    }
}
