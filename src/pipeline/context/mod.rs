#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use crate::index::SearchHit;

pub const ENTRY_SEPARATOR: &str = "\n\n";
pub const ELLIPSIS: &str = "...";

/// What to do when the next ranked entry does not fit in the remaining budget
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Cut the entry down to the remaining budget, if enough is left to be useful, then stop
    Truncate,
    /// Evict the earliest accepted entries until the new one fits
    #[default]
    Merge,
    /// Stop accepting entries; any unrecognized policy name means this
    #[serde(other)]
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Upper bound on the assembled context, in characters
    pub max_context_length: usize,
    pub overlap_policy: OverlapPolicy,
    /// Skip entries larger than the whole budget instead of cutting them
    pub preserve_chunk_boundaries: bool,
    /// Smallest remainder worth keeping under the truncate policy
    pub min_truncated_length: usize,
}

impl Default for ContextConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_context_length: 4000,
            overlap_policy: OverlapPolicy::Merge,
            preserve_chunk_boundaries: true,
            min_truncated_length: 50,
        }
    }
}

/// Context text plus the hits that made it in, in the order they appear
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    pub text: String,
    pub sources: Vec<SearchHit>,
}

impl AssembledContext {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

struct Entry<'a> {
    hit: &'a SearchHit,
    text: String,
    len: usize,
}

/// Accepted entries and the characters they occupy once joined
#[derive(Default)]
struct Accepted<'a> {
    entries: VecDeque<Entry<'a>>,
    len: usize,
}

impl<'a> Accepted<'a> {
    /// Characters `entry_len` would add, separator included
    fn cost(&self, entry_len: usize) -> usize {
        if self.entries.is_empty() {
            entry_len
        } else {
            entry_len + ENTRY_SEPARATOR.len()
        }
    }

    /// Room left for one more entry's text
    fn remaining(&self, max: usize) -> usize {
        max.saturating_sub(self.len + self.cost(0))
    }

    fn push(&mut self, entry: Entry<'a>) {
        self.len += self.cost(entry.len);
        self.entries.push_back(entry);
    }

    fn evict_front(&mut self) -> bool {
        let Some(evicted) = self.entries.pop_front() else {
            return false;
        };
        self.len -= evicted.len;
        if !self.entries.is_empty() {
            self.len -= ENTRY_SEPARATOR.len();
        }
        true
    }
}

/// Header and body for one retrieved chunk
#[inline]
pub fn format_entry(rank: usize, hit: &SearchHit) -> String {
    format!(
        "[{}] (Source: {}, relevance: {:.2})\n{}",
        rank, hit.record.metadata.source_id, hit.score, hit.record.content
    )
}

/// Pack ranked hits into one string of at most `max_context_length` characters
///
/// Entries are added best-first. When one does not fit, `overlap_policy` decides
/// between truncating it, evicting earlier entries, or stopping.
#[inline]
pub fn assemble_context(hits: &[SearchHit], config: &ContextConfig) -> AssembledContext {
    let max = config.max_context_length;
    let mut accepted = Accepted::default();

    for (position, hit) in hits.iter().enumerate() {
        let mut text = format_entry(position + 1, hit);
        let mut len = text.chars().count();

        if len > max {
            if config.preserve_chunk_boundaries {
                debug!(
                    "Skipping {} ({} chars exceeds the {} char budget)",
                    hit.record.chunk_id, len, max
                );
                continue;
            }
            text = truncate_chars(&text, max);
            len = text.chars().count();
        }

        if accepted.len + accepted.cost(len) <= max {
            accepted.push(Entry { hit, text, len });
            continue;
        }

        match config.overlap_policy {
            OverlapPolicy::Truncate => {
                let remaining = accepted.remaining(max);
                if remaining > config.min_truncated_length {
                    let text = truncate_chars(&text, remaining);
                    let len = text.chars().count();
                    accepted.push(Entry { hit, text, len });
                }
                break;
            }
            OverlapPolicy::Merge => {
                while accepted.len + accepted.cost(len) > max && accepted.evict_front() {}

                if accepted.len + accepted.cost(len) <= max {
                    accepted.push(Entry { hit, text, len });
                    continue;
                }
                // Only reachable when the entry alone exceeds the budget
                if !config.preserve_chunk_boundaries {
                    let text = truncate_chars(&text, max);
                    let len = text.chars().count();
                    accepted.push(Entry { hit, text, len });
                }
                break;
            }
            OverlapPolicy::Stop => break,
        }
    }

    let mut text = String::with_capacity(accepted.len);
    let mut sources = Vec::with_capacity(accepted.entries.len());
    for (i, entry) in accepted.entries.into_iter().enumerate() {
        if i > 0 {
            text.push_str(ENTRY_SEPARATOR);
        }
        text.push_str(&entry.text);
        sources.push(entry.hit.clone());
    }

    debug!(
        "Assembled {} of {} hits into {} chars",
        sources.len(),
        hits.len(),
        text.chars().count()
    );
    AssembledContext { text, sources }
}

/// At most `limit` characters of `text`, ending in an ellipsis when cut
#[inline]
pub fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let ellipsis_len = ELLIPSIS.len();
    if limit <= ellipsis_len {
        return text.chars().take(limit).collect();
    }
    let mut truncated: String = text.chars().take(limit - ellipsis_len).collect();
    truncated.push_str(ELLIPSIS);
    truncated
}
