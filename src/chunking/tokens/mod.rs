
use std::path::Path;
use tracing::info;

use crate::{RagError, Result};

/// Character offsets (not bytes) of one token in the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSpan {
    pub start: usize,
    pub end: usize,
}

/// Tokenizer with a stable vocabulary, used to count chunk windows in tokens
pub trait Tokenizer: Send + Sync {
    fn name(&self) -> &str;

    /// Ordered, non-empty spans of every token in `text`
    fn token_spans(&self, text: &str) -> Result<Vec<TokenSpan>>;

    fn count_tokens(&self, text: &str) -> Result<usize> {
        Ok(self.token_spans(text)?.len())
    }
}

/// Built-in tokenizer: alphanumeric runs are one token, every other visible character is its own
#[derive(Debug, Clone, Copy, Default)]
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn name(&self) -> &str {
        "word"
    }

    fn token_spans(&self, text: &str) -> Result<Vec<TokenSpan>> {
        let mut spans = Vec::new();
        let mut word_start: Option<usize> = None;

        for (i, c) in text.chars().enumerate() {
            if c.is_alphanumeric() || c == '_' {
                word_start.get_or_insert(i);
                continue;
            }
            if let Some(start) = word_start.take() {
                spans.push(TokenSpan { start, end: i });
            }
            if !c.is_whitespace() {
                spans.push(TokenSpan {
                    start: i,
                    end: i + 1,
                });
            }
        }

        if let Some(start) = word_start {
            spans.push(TokenSpan {
                start,
                end: text.chars().count(),
            });
        }

        Ok(spans)
    }
}

/// Wrapper around a Hugging Face `tokenizer.json`
pub struct HuggingFaceTokenizer {
    inner: tokenizers::Tokenizer,
    name: String,
}

impl std::fmt::Debug for HuggingFaceTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HuggingFaceTokenizer")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl HuggingFaceTokenizer {
    #[inline]
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            RagError::Tokenizer(format!(
                "Failed to load tokenizer from {}: {}",
                path.display(),
                e
            ))
        })?;

        info!(
            "Loaded tokenizer from {} (vocabulary size {})",
            path.display(),
            inner.get_vocab_size(true)
        );

        Ok(Self {
            inner,
            name: path.display().to_string(),
        })
    }
}

impl Tokenizer for HuggingFaceTokenizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn token_spans(&self, text: &str) -> Result<Vec<TokenSpan>> {
        let encoding = self
            .inner
            .encode_char_offsets(text, false)
            .map_err(|e| RagError::Tokenizer(format!("Failed to encode text: {}", e)))?;

        let text_len = text.chars().count();
        let mut spans: Vec<TokenSpan> = Vec::with_capacity(encoding.len());
        for &(start, end) in encoding.get_offsets() {
            let end = end.min(text_len);
            if start >= end {
                continue;
            }
            // Spans must stay monotonic for window arithmetic
            if spans.last().is_some_and(|last| start < last.start) {
                continue;
            }
            spans.push(TokenSpan { start, end });
        }

        Ok(spans)
    }
}
