//! Token counting for context budgets.
//!
//! Budgets are token-denominated, so the chunker never works on raw
//! character counts. A [`Tokenizer`] reports the byte offset at which each
//! token starts; chunk boundaries are placed on those offsets so that chunk
//! text slices can be reassembled into the original transcript exactly.
//!
//! [`WordTokenizer`] is the dependency-free fallback: every run of
//! alphanumeric characters is one token and every other non-whitespace
//! character is a token of its own. This tracks BPE counts for English
//! prose closely enough for budgeting. The native crate supplies a
//! model-exact tokenizer loaded from a `tokenizer.json`.

/// Splits text into tokens for budgeting purposes.
pub trait Tokenizer: Send + Sync {
    /// Short identifier shown in diagnostics (e.g. `"word"`).
    fn name(&self) -> &str;

    /// Byte offsets at which each token starts, strictly ascending.
    ///
    /// Every offset must be a UTF-8 char boundary of `text`.
    fn token_starts(&self, text: &str) -> Vec<usize>;

    /// Number of tokens in `text`.
    fn count_tokens(&self, text: &str) -> usize {
        self.token_starts(text).len()
    }
}

/// Word/punctuation tokenizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn name(&self) -> &str {
        "word"
    }

    fn token_starts(&self, text: &str) -> Vec<usize> {
        let mut starts = Vec::new();
        let mut in_word = false;
        for (i, ch) in text.char_indices() {
            if ch.is_alphanumeric() {
                if !in_word {
                    starts.push(i);
                    in_word = true;
                }
            } else {
                in_word = false;
                if !ch.is_whitespace() {
                    starts.push(i);
                }
            }
        }
        starts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        assert_eq!(WordTokenizer.count_tokens(""), 0);
        assert_eq!(WordTokenizer.count_tokens("  \n\t "), 0);
    }

    #[test]
    fn test_words_and_punctuation() {
        let text = "Hi, how's it going?";
        // Hi , how ' s it going ?
        assert_eq!(WordTokenizer.count_tokens(text), 8);
        assert_eq!(WordTokenizer.token_starts(text)[..3], [0, 2, 4]);
    }

    #[test]
    fn test_render_header_is_ten_tokens() {
        assert_eq!(WordTokenizer.count_tokens("[#1234 @ 102:05] Rep: "), 10);
    }

    #[test]
    fn test_multibyte_boundaries() {
        let text = "café — naïve";
        for s in WordTokenizer.token_starts(text) {
            assert!(text.is_char_boundary(s));
        }
        assert_eq!(WordTokenizer.count_tokens(text), 3);
    }
}
