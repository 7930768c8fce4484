#[cfg(test)]
mod tests;

pub mod tokens;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::Result;
pub use tokens::{HuggingFaceTokenizer, TokenSpan, Tokenizer, WordTokenizer};

/// How document text is cut into windows
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    /// Character windows that prefer paragraph, sentence and word boundaries
    #[default]
    Characters,
    /// Fixed windows counted in tokenizer tokens
    Tokens,
}

/// Configuration for content chunking
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub strategy: ChunkingStrategy,
    /// Window size in characters or tokens, depending on the strategy
    pub chunk_size: usize,
    /// Overlap between adjacent windows, in the same unit as `chunk_size`
    pub overlap: usize,
    /// `tokenizer.json` used by the token strategy; the built-in word tokenizer otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokenizer_path: Option<PathBuf>,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            strategy: ChunkingStrategy::Characters,
            chunk_size: 1000,
            overlap: 200,
            tokenizer_path: None,
        }
    }
}

/// A bounded span of a document's text
///
/// `char_start..char_end` is the span of the source (in characters) this chunk was
/// cut from. The spans of one document's chunks cover the whole text; `content` is
/// that span with surrounding whitespace trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub document_id: String,
    pub chunk_index: usize,
    pub content: String,
    pub char_start: usize,
    pub char_end: usize,
    pub token_count: Option<usize>,
}

/// Splits documents according to a [`ChunkingConfig`]
#[derive(Clone)]
pub struct Chunker {
    config: ChunkingConfig,
    tokenizer: Arc<dyn Tokenizer>,
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("config", &self.config)
            .field("tokenizer", &self.tokenizer.name())
            .finish()
    }
}

impl Chunker {
    /// Build a chunker, loading the configured tokenizer file when the token strategy needs one
    #[inline]
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        let tokenizer: Arc<dyn Tokenizer> = match (&config.strategy, &config.tokenizer_path) {
            (ChunkingStrategy::Tokens, Some(path)) => {
                Arc::new(HuggingFaceTokenizer::from_file(path)?)
            }
            _ => Arc::new(WordTokenizer),
        };
        Ok(Self { config, tokenizer })
    }

    #[inline]
    pub fn with_tokenizer(config: ChunkingConfig, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { config, tokenizer }
    }

    #[inline]
    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Split `text` into ordered, overlapping chunks belonging to `document_id`
    #[inline]
    pub fn split(&self, document_id: &str, text: &str) -> Result<Vec<Chunk>> {
        let chunks = match self.config.strategy {
            ChunkingStrategy::Characters => split_characters(
                document_id,
                text,
                self.config.chunk_size,
                self.config.overlap,
            ),
            ChunkingStrategy::Tokens => split_tokens(
                document_id,
                text,
                self.tokenizer.as_ref(),
                self.config.chunk_size,
                self.config.overlap,
            )?,
        };

        debug!(
            "Split document {} ({} chars) into {} chunks using {:?} strategy",
            document_id,
            text.chars().count(),
            chunks.len(),
            self.config.strategy
        );

        Ok(chunks)
    }
}

/// One candidate window before blank windows are folded away
struct Window {
    range: (usize, usize),
    content: String,
    token_count: Option<usize>,
}

/// Character-window splitting with boundary-aware breaks
#[inline]
pub fn split_characters(
    document_id: &str,
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    if len == 0 {
        return Vec::new();
    }

    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size - 1);

    let mut windows = Vec::new();
    let mut start = 0;
    loop {
        let hard_end = (start + chunk_size).min(len);
        let end = if hard_end == len {
            len
        } else {
            find_break(&chars, start, hard_end, chunk_size, overlap)
        };

        let content: String = chars[start..end].iter().collect();
        let content = content.trim().to_string();
        let token_count = Some(estimate_token_count(&content));
        windows.push(Window {
            range: (start, end),
            content,
            token_count,
        });

        if end >= len {
            break;
        }

        // find_break keeps `end - start > overlap`, so this always advances
        let next = end.saturating_sub(overlap).max(start + 1);
        start = align_to_word_start(&chars, next, end);
    }

    assemble_chunks(document_id, windows)
}

/// Fixed-size token-window splitting; sizes are counted in tokens
#[inline]
pub fn split_tokens(
    document_id: &str,
    text: &str,
    tokenizer: &dyn Tokenizer,
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>> {
    let chars: Vec<char> = text.chars().collect();
    let spans = tokenizer.token_spans(text)?;
    if spans.is_empty() {
        return Ok(Vec::new());
    }

    let chunk_size = chunk_size.max(1);
    let step = chunk_size - overlap.min(chunk_size - 1);
    let total = spans.len();

    let mut windows = Vec::new();
    let mut first = 0;
    loop {
        let last = (first + chunk_size).min(total);
        let range_start = if first == 0 { 0 } else { spans[first].start };
        let range_end = if last == total {
            chars.len()
        } else {
            spans[last].start
        };

        let content: String = chars[spans[first].start..spans[last - 1].end]
            .iter()
            .collect();
        windows.push(Window {
            range: (range_start, range_end),
            content: content.trim().to_string(),
            token_count: Some(last - first),
        });

        if last == total {
            break;
        }
        first += step;
    }

    Ok(assemble_chunks(document_id, windows))
}

/// Turn windows into dense, zero-based chunks; blank windows fold into their neighbours
fn assemble_chunks(document_id: &str, windows: Vec<Window>) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::with_capacity(windows.len());
    let mut carried_start: Option<usize> = None;

    for window in windows {
        let (start, end) = window.range;
        if window.content.is_empty() {
            match chunks.last_mut() {
                Some(previous) => previous.char_end = previous.char_end.max(end),
                None => {
                    carried_start.get_or_insert(start);
                }
            }
            continue;
        }

        let char_start = carried_start.take().map_or(start, |carried| carried.min(start));
        chunks.push(Chunk {
            document_id: document_id.to_string(),
            chunk_index: chunks.len(),
            content: window.content,
            char_start,
            char_end: end,
            token_count: window.token_count,
        });
    }

    chunks
}

/// Pick the best break position in the back half of the window
///
/// Preference order: paragraph break, sentence end, line break, any whitespace.
/// Falls back to the hard window end. The window always ends more than `overlap`
/// characters after `start`, so the next window starts inside this one.
fn find_break(
    chars: &[char],
    start: usize,
    hard_end: usize,
    chunk_size: usize,
    overlap: usize,
) -> usize {
    let floor = start + (chunk_size / 2).max(overlap + 1);
    if floor >= hard_end {
        return hard_end;
    }

    let mut sentence = None;
    let mut line = None;
    let mut space = None;

    // Candidate `pos` is an exclusive end: the window becomes chars[start..pos]
    for pos in (floor..=hard_end).rev() {
        let prev = chars[pos - 1];
        if prev == '\n' && pos >= 2 && chars[pos - 2] == '\n' {
            return pos;
        }
        if sentence.is_none()
            && prev.is_whitespace()
            && pos >= 2
            && matches!(chars[pos - 2], '.' | '!' | '?' | '。' | '！' | '？')
        {
            sentence = Some(pos);
        }
        if line.is_none() && prev == '\n' {
            line = Some(pos);
        }
        if space.is_none() && prev.is_whitespace() {
            space = Some(pos);
        }
    }

    sentence.or(line).or(space).unwrap_or(hard_end)
}

/// Move `pos` forward to the next word start before `limit`, if there is one
fn align_to_word_start(chars: &[char], pos: usize, limit: usize) -> usize {
    if pos == 0 || chars[pos - 1].is_whitespace() {
        return pos;
    }
    (pos..limit)
        .find(|&p| chars[p - 1].is_whitespace() && !chars[p].is_whitespace())
        .unwrap_or(pos)
}

/// Estimate token count using a simple heuristic
/// This is a rough approximation - the token strategy uses a real tokenizer
#[inline]
pub fn estimate_token_count(text: &str) -> usize {
    // Rough heuristic: 1 token ≈ 0.75 words for English text
    // Add extra tokens for punctuation and special characters
    let word_count = text.split_whitespace().count();
    let punct_count = text.chars().filter(|c| c.is_ascii_punctuation()).count();

    (punct_count as f64).mul_add(0.1, word_count as f64 / 0.75) as usize
}
