// Conversation vector index
// Chunk records and their vectors, searchable and removable per conversation

pub mod persistence;
pub mod store;


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::chunking::Chunk;
use crate::documents::Document;
use crate::{RagError, Result};
use persistence::{IndexFiles, MetadataRef};
use store::{FlatStore, l2_normalize};

pub use store::dot;

/// Searches request this many candidates per wanted hit before filtering by conversation
const OVERFETCH_FACTOR: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub source_id: String,
    pub filename: Option<String>,
    pub content_hash: String,
    pub chunk_index: usize,
    pub char_start: usize,
    pub char_end: usize,
    pub token_count: Option<usize>,
    pub indexed_at: DateTime<Utc>,
}

/// One indexed chunk; `slot_index` is only valid until the next rebuild
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub content: String,
    pub conversation_id: String,
    pub document_id: String,
    pub slot_index: usize,
    pub metadata: RecordMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub record: VectorRecord,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub source_id: String,
    pub filename: Option<String>,
    pub content_hash: String,
    pub chunk_count: usize,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct IndexStats {
    pub total_vectors: usize,
    pub total_documents: usize,
    pub conversation_count: usize,
    pub dimension: Option<usize>,
    pub rebuild_count: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct IndexState {
    store: FlatStore,
    records: Vec<VectorRecord>,
    conversations: BTreeMap<String, BTreeSet<usize>>,
    rebuild_count: u64,
    last_updated: Option<DateTime<Utc>>,
}

impl IndexState {
    fn metadata(&self) -> MetadataRef<'_> {
        MetadataRef {
            format_version: persistence::FORMAT_VERSION,
            vector_count: self.store.len(),
            dimension: self.store.dimension(),
            rebuild_count: self.rebuild_count,
            last_updated: self.last_updated,
            records: &self.records,
            conversations: &self.conversations,
        }
    }

    /// Copy every record outside `conversation_id` into a fresh store
    ///
    /// Surviving vectors are copied as stored, without renormalizing, so their
    /// scores against any query are unchanged.
    fn without_conversation(&self, conversation_id: &str) -> (Self, usize) {
        let removed_slots = self
            .conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();

        let mut rebuilt = Self {
            rebuild_count: self.rebuild_count + 1,
            last_updated: Some(Utc::now()),
            ..Self::default()
        };

        for record in &self.records {
            if removed_slots.contains(&record.slot_index) {
                continue;
            }
            let Some(vector) = self.store.vector(record.slot_index) else {
                continue;
            };
            let slot = rebuilt.store.len();
            rebuilt.store.push_normalized(vector);
            rebuilt
                .conversations
                .entry(record.conversation_id.clone())
                .or_default()
                .insert(slot);
            rebuilt.records.push(VectorRecord {
                slot_index: slot,
                ..record.clone()
            });
        }

        (rebuilt, removed_slots.len())
    }
}

/// Conversation-scoped vector index guarded by one exclusive lock
///
/// Reads and writes both take the lock, so a search never observes a half-finished
/// insert or rebuild. When opened with a directory, every mutation is persisted
/// before it becomes visible.
#[derive(Debug)]
pub struct ConversationVectorIndex {
    state: Mutex<IndexState>,
    files: Option<IndexFiles>,
}

impl ConversationVectorIndex {
    /// Index that lives only in memory
    #[inline]
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(IndexState::default()),
            files: None,
        }
    }

    /// Open the persisted pair `<dir>/<stem>.vectors` + `<dir>/<stem>.meta.json`
    ///
    /// A missing, partial or corrupt pair yields an empty index; the broken files
    /// are overwritten by the next mutation.
    #[inline]
    pub fn open(dir: &Path, stem: &str) -> Self {
        let files = IndexFiles::new(dir, stem);

        let state = match persistence::load(&files) {
            Ok(Some((store, metadata))) => {
                info!(
                    "Loaded vector index with {} vectors across {} conversations",
                    store.len(),
                    metadata.conversations.len()
                );
                IndexState {
                    store,
                    records: metadata.records,
                    conversations: metadata.conversations,
                    rebuild_count: metadata.rebuild_count,
                    last_updated: metadata.last_updated,
                }
            }
            Ok(None) => {
                debug!("No persisted index at {}, starting empty", dir.display());
                IndexState::default()
            }
            Err(e) => {
                warn!(
                    "Discarding unreadable index at {}, starting empty: {}",
                    dir.display(),
                    e
                );
                IndexState::default()
            }
        };

        Self {
            state: Mutex::new(state),
            files: Some(files),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &IndexState) -> Result<()> {
        match &self.files {
            Some(files) => persistence::save(files, &state.store, &state.metadata()),
            None => Ok(()),
        }
    }

    /// Store one document's chunks and vectors under `conversation_id`
    ///
    /// # Arguments
    /// * `conversation_id` - Conversation that will be able to search these chunks
    /// * `document` - The ingested document the chunks were cut from
    /// * `chunks` / `vectors` - Parallel slices; vector `i` embeds chunk `i`
    ///
    /// # Returns
    /// * `Result<Vec<String>>` - Ids of the new records, in chunk order
    #[inline]
    pub fn index_document(
        &self,
        conversation_id: &str,
        document: &Document,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<Vec<String>> {
        if conversation_id.trim().is_empty() {
            return Err(RagError::InvalidRequest(
                "conversation id must not be empty".to_string(),
            ));
        }
        if chunks.len() != vectors.len() {
            return Err(RagError::LengthMismatch {
                chunks: chunks.len(),
                vectors: vectors.len(),
            });
        }
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.lock();
        let first_slot = state.store.add(vectors)?;
        let indexed_at = Utc::now();

        let mut chunk_ids = Vec::with_capacity(chunks.len());
        for (offset, chunk) in chunks.iter().enumerate() {
            let slot = first_slot + offset;
            let chunk_id = format!("{}:{}", document.id, chunk.chunk_index);
            state.records.push(VectorRecord {
                chunk_id: chunk_id.clone(),
                content: chunk.content.clone(),
                conversation_id: conversation_id.to_string(),
                document_id: document.id.clone(),
                slot_index: slot,
                metadata: RecordMetadata {
                    source_id: document.source_id.clone(),
                    filename: document.metadata.filename.clone(),
                    content_hash: document.content_hash.clone(),
                    chunk_index: chunk.chunk_index,
                    char_start: chunk.char_start,
                    char_end: chunk.char_end,
                    token_count: chunk.token_count,
                    indexed_at,
                },
            });
            state
                .conversations
                .entry(conversation_id.to_string())
                .or_default()
                .insert(slot);
            chunk_ids.push(chunk_id);
        }
        let previous_update = state.last_updated.replace(indexed_at);

        if let Err(e) = self.persist(&state) {
            error!(
                "Failed to persist index after adding document {}, rolling back: {}",
                document.id, e
            );
            rollback_append(&mut state, conversation_id, first_slot, previous_update);
            return Err(e);
        }

        info!(
            "Indexed {} chunks of document {} into conversation {}",
            chunk_ids.len(),
            document.id,
            conversation_id
        );
        Ok(chunk_ids)
    }

    /// Rank `conversation_id`'s chunks against `query`, best first
    ///
    /// The whole store is searched and hits outside the conversation are filtered
    /// out afterwards, over-fetching and widening until `top_k` hits survive or the
    /// store is exhausted.
    #[inline]
    pub fn search(&self, conversation_id: &str, query: &[f32], top_k: usize) -> Result<Vec<SearchHit>> {
        let state = self.lock();

        let Some(allowed) = state.conversations.get(conversation_id) else {
            debug!("Conversation {} has no indexed chunks", conversation_id);
            return Ok(Vec::new());
        };
        if top_k == 0 {
            return Ok(Vec::new());
        }
        if let Some(dimension) = state.store.dimension() {
            if query.len() != dimension {
                return Err(RagError::DimensionMismatch {
                    expected: dimension,
                    actual: query.len(),
                });
            }
        }
        let Some(query) = l2_normalize(query) else {
            warn!("Ignoring search with a zero query vector");
            return Ok(Vec::new());
        };

        let total = state.store.len();
        let mut fetch = top_k.saturating_mul(OVERFETCH_FACTOR).min(total);
        let matches = loop {
            let matches: Vec<(usize, f32)> = state
                .store
                .search(&query, fetch)
                .into_iter()
                .filter(|(slot, _)| allowed.contains(slot))
                .take(top_k)
                .collect();

            if matches.len() >= top_k || fetch >= total {
                break matches;
            }
            debug!(
                "Only {} of {} candidates belong to {}, widening search",
                matches.len(),
                fetch,
                conversation_id
            );
            fetch = fetch.saturating_mul(2).min(total);
        };

        Ok(matches
            .into_iter()
            .filter_map(|(slot, score)| {
                state.records.get(slot).map(|record| SearchHit {
                    record: record.clone(),
                    score,
                })
            })
            .collect())
    }

    /// Remove every record of `conversation_id` by rebuilding the store from the survivors
    ///
    /// This copies every surviving vector and is O(n) in the size of the whole
    /// index, not of the conversation. Returns the number of records removed.
    #[inline]
    pub fn remove_conversation(&self, conversation_id: &str) -> Result<usize> {
        let mut state = self.lock();
        if !state.conversations.contains_key(conversation_id) {
            debug!("Conversation {} not indexed, nothing to remove", conversation_id);
            return Ok(0);
        }

        let started = Instant::now();
        let (rebuilt, removed) = state.without_conversation(conversation_id);
        self.persist(&rebuilt)?;
        *state = rebuilt;

        info!(
            "Removed {} records of conversation {} in {:?} ({} vectors remain)",
            removed,
            conversation_id,
            started.elapsed(),
            state.store.len()
        );
        Ok(removed)
    }

    /// Drop every vector and record, e.g. after switching embedding models
    #[inline]
    pub fn reset(&self) -> Result<()> {
        let mut state = self.lock();
        let emptied = IndexState {
            rebuild_count: state.rebuild_count,
            last_updated: Some(Utc::now()),
            ..IndexState::default()
        };
        self.persist(&emptied)?;
        *state = emptied;

        info!("Vector index reset");
        Ok(())
    }

    #[inline]
    pub fn stats(&self) -> IndexStats {
        let state = self.lock();
        let documents: HashSet<&str> = state
            .records
            .iter()
            .map(|record| record.document_id.as_str())
            .collect();

        IndexStats {
            total_vectors: state.store.len(),
            total_documents: documents.len(),
            conversation_count: state.conversations.len(),
            dimension: state.store.dimension(),
            rebuild_count: state.rebuild_count,
            last_updated: state.last_updated,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lock().store.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Conversations with indexed chunks and their chunk counts
    #[inline]
    pub fn conversations(&self) -> Vec<(String, usize)> {
        self.lock()
            .conversations
            .iter()
            .map(|(id, slots)| (id.clone(), slots.len()))
            .collect()
    }

    #[inline]
    pub fn conversation_chunk_count(&self, conversation_id: &str) -> usize {
        self.lock()
            .conversations
            .get(conversation_id)
            .map_or(0, BTreeSet::len)
    }

    /// Documents indexed under `conversation_id`, in the order they were indexed
    #[inline]
    pub fn document_summaries(&self, conversation_id: &str) -> Vec<DocumentSummary> {
        let state = self.lock();
        let mut summaries: Vec<DocumentSummary> = Vec::new();
        let mut positions: HashMap<&str, usize> = HashMap::new();

        for record in state
            .records
            .iter()
            .filter(|record| record.conversation_id == conversation_id)
        {
            if let Some(&position) = positions.get(record.document_id.as_str()) {
                if let Some(summary) = summaries.get_mut(position) {
                    summary.chunk_count += 1;
                }
                continue;
            }
            positions.insert(&record.document_id, summaries.len());
            summaries.push(DocumentSummary {
                document_id: record.document_id.clone(),
                source_id: record.metadata.source_id.clone(),
                filename: record.metadata.filename.clone(),
                content_hash: record.metadata.content_hash.clone(),
                chunk_count: 1,
                indexed_at: record.metadata.indexed_at,
            });
        }
        summaries
    }
}

/// Undo an append that could not be persisted
fn rollback_append(
    state: &mut IndexState,
    conversation_id: &str,
    first_slot: usize,
    previous_update: Option<DateTime<Utc>>,
) {
    state.store.truncate(first_slot);
    state.records.truncate(first_slot);
    if let Some(slots) = state.conversations.get_mut(conversation_id) {
        slots.retain(|&slot| slot < first_slot);
        if slots.is_empty() {
            state.conversations.remove(conversation_id);
        }
    }
    state.last_updated = previous_update;
}
