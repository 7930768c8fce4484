// Conversation context tracker
// Per-conversation document membership and a rolling window of question/answer turns


use chrono::{DateTime, Utc};
use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::completion::{ChatMessage, CompletionBackend};

pub const DEFAULT_MAX_TURNS: usize = 10;

const REWRITE_INSTRUCTIONS: &str = "Rewrite the user's latest question as a standalone search \
query, resolving references to earlier turns of the conversation. Reply with the query only.";

/// Labels models like to put in front of a rewritten query
static QUERY_LABEL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:(?:rewritten|standalone|search)\s+)*query\s*:\s*")
        .expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub question: String,
    pub answer: String,
    pub asked_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ConversationState {
    documents: Vec<String>,
    turns: VecDeque<Turn>,
}

#[derive(Debug)]
pub struct ConversationTracker {
    max_turns: usize,
    conversations: Mutex<HashMap<String, ConversationState>>,
}

impl Default for ConversationTracker {
    #[inline]
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TURNS)
    }
}

impl ConversationTracker {
    #[inline]
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ConversationState>> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `document_id` was ingested into `conversation_id`; repeats are ignored
    #[inline]
    pub fn attach_document(&self, conversation_id: &str, document_id: &str) {
        let mut conversations = self.lock();
        let state = conversations.entry(conversation_id.to_string()).or_default();
        if !state.documents.iter().any(|id| id == document_id) {
            state.documents.push(document_id.to_string());
        }
    }

    /// Seed document membership, e.g. from a reloaded index
    #[inline]
    pub fn hydrate<I, D>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, D)>,
        D: IntoIterator<Item = String>,
    {
        let mut count = 0_usize;
        for (conversation_id, documents) in entries {
            for document_id in documents {
                self.attach_document(&conversation_id, &document_id);
                count += 1;
            }
        }
        debug!("Hydrated tracker with {} document attachments", count);
    }

    /// Documents attached to `conversation_id`, in attach order
    #[inline]
    pub fn documents(&self, conversation_id: &str) -> Vec<String> {
        self.lock()
            .get(conversation_id)
            .map(|state| state.documents.clone())
            .unwrap_or_default()
    }

    #[inline]
    pub fn record_turn(&self, conversation_id: &str, question: &str, answer: &str) {
        if self.max_turns == 0 {
            return;
        }

        let mut conversations = self.lock();
        let state = conversations.entry(conversation_id.to_string()).or_default();
        state.turns.push_back(Turn {
            question: question.to_string(),
            answer: answer.to_string(),
            asked_at: Utc::now(),
        });
        while state.turns.len() > self.max_turns {
            state.turns.pop_front();
        }
    }

    /// Up to `limit` most recent turns, oldest first
    #[inline]
    pub fn recent_turns(&self, conversation_id: &str, limit: usize) -> Vec<Turn> {
        self.lock()
            .get(conversation_id)
            .map(|state| {
                let skip = state.turns.len().saturating_sub(limit);
                state.turns.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Drop everything known about `conversation_id`
    #[inline]
    pub fn forget(&self, conversation_id: &str) -> bool {
        self.lock().remove(conversation_id).is_some()
    }

    #[inline]
    pub fn conversation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Turn a follow-up question into a self-contained query using recent history
    ///
    /// Best effort: without history, or on any completion failure or empty reply,
    /// the original question is returned unchanged.
    #[inline]
    pub fn rewrite_query(
        &self,
        backend: &dyn CompletionBackend,
        conversation_id: &str,
        question: &str,
        history_turns: usize,
    ) -> String {
        let turns = self.recent_turns(conversation_id, history_turns);
        if turns.is_empty() {
            return question.to_string();
        }

        let messages = [
            ChatMessage::system(REWRITE_INSTRUCTIONS),
            ChatMessage::user(rewrite_prompt(&turns, question)),
        ];

        match backend.complete(&messages) {
            Ok(reply) => match clean_rewrite(&reply) {
                Some(rewritten) => {
                    debug!("Rewrote query {:?} as {:?}", question, rewritten);
                    rewritten
                }
                None => {
                    warn!("Query rewrite returned nothing usable, keeping original question");
                    question.to_string()
                }
            },
            Err(e) => {
                warn!("Query rewrite failed, keeping original question: {}", e);
                question.to_string()
            }
        }
    }
}

fn rewrite_prompt(turns: &[Turn], question: &str) -> String {
    let mut prompt = String::from("Conversation so far:\n");
    for turn in turns {
        let _ = writeln!(prompt, "User: {}", turn.question);
        let _ = writeln!(prompt, "Assistant: {}", turn.answer);
    }
    let _ = write!(prompt, "\nLatest question: {}", question);
    prompt
}

/// First non-empty line of the reply, without a leading label or wrapping quotes
fn clean_rewrite(reply: &str) -> Option<String> {
    let line = reply.lines().map(str::trim).find(|line| !line.is_empty())?;
    let unlabeled = QUERY_LABEL_REGEX.replace(line, "");
    let cleaned = unlabeled.trim().trim_matches(['"', '\'', '`']).trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}
