// Retrieval pipeline
// Ingestion (chunk, embed, index) and querying (embed, search, assemble, generate)

pub mod context;
pub mod worker;


use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chunking::Chunker;
use crate::completion::{ChatMessage, CompletionBackend, CompletionClient};
use crate::config::Config;
use crate::documents::{Document, DocumentSource};
use crate::embeddings::{Embedder, EmbeddingClient};
use crate::http::RetryPolicy;
use crate::index::{ConversationVectorIndex, DocumentSummary, SearchHit};
use crate::tracker::ConversationTracker;
use crate::{RagError, Result};
pub use context::{AssembledContext, ContextConfig, OverlapPolicy, assemble_context};
pub use worker::{IngestEvent, IngestHandle, IngestOutcome, IngestWorker, JobId};

pub const SKIPPED_DOCUMENT_MESSAGE: &str = "document skipped, re-check service configuration";
pub const SERVICE_UNAVAILABLE_ANSWER: &str =
    "The embedding service is unavailable right now, so no documents could be searched. \
     Please try again later.";
pub const GENERATION_FAILED_ANSWER: &str =
    "Relevant documents were found, but the answer could not be generated. Please try again later.";
pub const NO_CONTEXT_ANSWER: &str =
    "None of the documents in this conversation appear relevant to the question.";

const ANSWER_INSTRUCTIONS: &str = "Answer the question using only the numbered context \
entries below. Cite entries by their number. If the context does not contain the answer, say so.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Hits scoring below this cosine similarity are discarded before assembly
    pub similarity_threshold: f32,
    /// Rewrite follow-up questions into standalone queries using recent turns
    pub rewrite_queries: bool,
    /// Turns used for query rewriting and included in the answer prompt
    pub history_turns: usize,
    /// Turns retained per conversation
    pub max_turns: usize,
    #[serde(flatten)]
    pub context: ContextConfig,
}

impl Default for RetrievalConfig {
    #[inline]
    fn default() -> Self {
        Self {
            top_k: 5,
            similarity_threshold: 0.2,
            rewrite_queries: true,
            history_turns: 3,
            max_turns: crate::tracker::DEFAULT_MAX_TURNS,
            context: ContextConfig::default(),
        }
    }
}

/// A chunk cited by an answer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub chunk_id: String,
    pub document_id: String,
    pub source_id: String,
    pub chunk_index: usize,
    pub score: f32,
}

impl From<&SearchHit> for Citation {
    #[inline]
    fn from(hit: &SearchHit) -> Self {
        Self {
            chunk_id: hit.record.chunk_id.clone(),
            document_id: hit.record.document_id.clone(),
            source_id: hit.record.metadata.source_id.clone(),
            chunk_index: hit.record.metadata.chunk_index,
            score: hit.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum AnswerStatus {
    Answered,
    /// Nothing in the conversation scored above the similarity threshold
    NoRelevantContext,
    /// Embedding or generation failed; the answer is a safe placeholder citing nothing
    Degraded(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<Citation>,
    pub status: AnswerStatus,
    /// The query actually embedded, when rewriting changed it
    pub search_query: Option<String>,
}

impl Answer {
    fn degraded(text: &str, reason: impl Into<String>) -> Self {
        Self {
            text: text.to_string(),
            sources: Vec::new(),
            status: AnswerStatus::Degraded(reason.into()),
            search_query: None,
        }
    }

    #[inline]
    pub fn is_degraded(&self) -> bool {
        matches!(self.status, AnswerStatus::Degraded(_))
    }
}

impl fmt::Display for Answer {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Result of indexing one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub document_id: String,
    pub content_hash: String,
    pub chunk_ids: Vec<String>,
}

/// Intermediate ingestion milestones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestProgress {
    Chunked { chunks: usize },
    Embedded { vectors: usize },
}

/// Orchestrates chunker, embedder, index and completion backend for all conversations
pub struct RetrievalPipeline {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    completion: Arc<dyn CompletionBackend>,
    index: Arc<ConversationVectorIndex>,
    tracker: ConversationTracker,
    config: RetrievalConfig,
}

impl fmt::Debug for RetrievalPipeline {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrievalPipeline")
            .field("chunker", &self.chunker)
            .field("index", &self.index)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetrievalPipeline {
    /// Assemble a pipeline from its collaborators and seed the tracker from the index
    #[inline]
    pub fn new(
        chunker: Chunker,
        embedder: Arc<dyn Embedder>,
        completion: Arc<dyn CompletionBackend>,
        index: Arc<ConversationVectorIndex>,
        config: RetrievalConfig,
    ) -> Self {
        let tracker = ConversationTracker::new(config.max_turns);
        tracker.hydrate(index.conversations().into_iter().map(|(conversation_id, _)| {
            let documents = index
                .document_summaries(&conversation_id)
                .into_iter()
                .map(|summary| summary.document_id);
            (conversation_id, documents)
        }));

        Self {
            chunker,
            embedder,
            completion,
            index,
            tracker,
            config,
        }
    }

    /// Build the remote clients and open the persisted index described by `config`
    #[inline]
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder = EmbeddingClient::new(&config.embedding)?;
        let completion = CompletionClient::new(
            &config.completion,
            RetryPolicy {
                attempts: config.embedding.retry_attempts,
                base_delay: std::time::Duration::from_millis(config.embedding.retry_base_delay_ms),
            },
        )?;
        let index = ConversationVectorIndex::open(&config.index_dir(), &config.index.file_stem);

        Ok(Self::new(
            Chunker::new(config.chunking.clone())?,
            Arc::new(embedder),
            Arc::new(completion),
            Arc::new(index),
            config.retrieval.clone(),
        ))
    }

    #[inline]
    pub fn index(&self) -> &ConversationVectorIndex {
        &self.index
    }

    #[inline]
    pub fn tracker(&self) -> &ConversationTracker {
        &self.tracker
    }

    #[inline]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Chunk, embed and index `source` under `conversation_id`, returning the document id
    ///
    /// Fails with [`RagError::EmbeddingDegraded`] and leaves the index untouched if
    /// any chunk could not be embedded.
    #[inline]
    pub fn ingest(&self, conversation_id: &str, source: &DocumentSource) -> Result<String> {
        self.ingest_observed(conversation_id, source, &mut |_| {})
            .map(|report| report.document_id)
    }

    /// [`Self::ingest`], reporting milestones to `observer` as they happen
    #[inline]
    pub fn ingest_observed(
        &self,
        conversation_id: &str,
        source: &DocumentSource,
        observer: &mut dyn FnMut(IngestProgress),
    ) -> Result<IngestReport> {
        self.ingest_inner(conversation_id, source, observer)
            .map_err(|e| e.in_operation("ingest", conversation_id))
    }

    fn ingest_inner(
        &self,
        conversation_id: &str,
        source: &DocumentSource,
        observer: &mut dyn FnMut(IngestProgress),
    ) -> Result<IngestReport> {
        let document = Document::from_source(source);
        debug!(
            "Ingesting {} into {} as document {} (sha256 {})",
            document.source_id, conversation_id, document.id, document.content_hash
        );

        let chunks = self.chunker.split(&document.id, &source.text)?;
        if chunks.is_empty() {
            return Err(RagError::InvalidRequest(format!(
                "{} contains no text to index",
                document.source_id
            )));
        }
        observer(IngestProgress::Chunked {
            chunks: chunks.len(),
        });

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts)?;
        if embeddings.len() != chunks.len() {
            return Err(RagError::LengthMismatch {
                chunks: chunks.len(),
                vectors: embeddings.len(),
            });
        }

        let degraded = embeddings
            .iter()
            .filter(|embedding| embedding.is_fallback())
            .count();
        if degraded > 0 {
            warn!(
                "Skipping {}: {} of {} chunk embeddings are fallback vectors",
                document.source_id,
                degraded,
                chunks.len()
            );
            return Err(RagError::EmbeddingDegraded(format!(
                "{SKIPPED_DOCUMENT_MESSAGE} ({degraded} of {} chunks could not be embedded)",
                chunks.len()
            )));
        }
        observer(IngestProgress::Embedded {
            vectors: embeddings.len(),
        });

        let vectors: Vec<Vec<f32>> = embeddings
            .into_iter()
            .map(|embedding| embedding.vector)
            .collect();
        let chunk_ids = self
            .index
            .index_document(conversation_id, &document, &chunks, &vectors)?;
        self.tracker.attach_document(conversation_id, &document.id);

        info!(
            "Ingested {} into conversation {}: {} chunks",
            document.source_id,
            conversation_id,
            chunk_ids.len()
        );
        Ok(IngestReport {
            document_id: document.id,
            content_hash: document.content_hash,
            chunk_ids,
        })
    }

    /// Answer `question` from the documents of `conversation_id`
    ///
    /// Embedding and generation failures produce a degraded answer citing no
    /// sources rather than an error; only a blank question is rejected.
    #[inline]
    pub fn query(&self, conversation_id: &str, question: &str) -> Result<Answer> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::InvalidRequest("question must not be empty".to_string()));
        }

        let search_query = if self.config.rewrite_queries {
            self.tracker.rewrite_query(
                self.completion.as_ref(),
                conversation_id,
                question,
                self.config.history_turns,
            )
        } else {
            question.to_string()
        };

        debug!("Embedding query for conversation {}", conversation_id);
        let query_vector = match self.embedder.embed(&search_query) {
            Ok(embedding) if !embedding.is_fallback() => embedding.vector,
            Ok(_) => {
                warn!("Query embedding degraded, answering without search");
                return Ok(Answer::degraded(
                    SERVICE_UNAVAILABLE_ANSWER,
                    "embedding service returned a fallback vector",
                ));
            }
            Err(e) => {
                warn!("Query embedding failed: {}", e);
                return Ok(Answer::degraded(SERVICE_UNAVAILABLE_ANSWER, e.to_string()));
            }
        };

        debug!("Searching conversation {}", conversation_id);
        let hits = match self
            .index
            .search(conversation_id, &query_vector, self.config.top_k)
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Search failed for conversation {}: {}", conversation_id, e);
                return Ok(Answer::degraded(SERVICE_UNAVAILABLE_ANSWER, e.to_string()));
            }
        };
        let relevant: Vec<SearchHit> = hits
            .into_iter()
            .filter(|hit| hit.score >= self.config.similarity_threshold)
            .collect();

        let rewritten = (search_query != question).then_some(search_query);
        if relevant.is_empty() {
            debug!("No hits above threshold in conversation {}", conversation_id);
            return Ok(Answer {
                text: NO_CONTEXT_ANSWER.to_string(),
                sources: Vec::new(),
                status: AnswerStatus::NoRelevantContext,
                search_query: rewritten,
            });
        }

        let context = assemble_context(&relevant, &self.config.context);
        let messages = self.answer_prompt(conversation_id, question, &context);

        debug!(
            "Generating answer from {} context entries",
            context.sources.len()
        );
        match self.completion.complete(&messages) {
            Ok(text) => {
                self.tracker.record_turn(conversation_id, question, &text);
                Ok(Answer {
                    text,
                    sources: context.sources.iter().map(Citation::from).collect(),
                    status: AnswerStatus::Answered,
                    search_query: rewritten,
                })
            }
            Err(e) => {
                warn!("Answer generation failed: {}", e);
                Ok(Answer::degraded(GENERATION_FAILED_ANSWER, e.to_string()))
            }
        }
    }

    fn answer_prompt(
        &self,
        conversation_id: &str,
        question: &str,
        context: &AssembledContext,
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(format!(
            "{ANSWER_INSTRUCTIONS}\n\nContext:\n{}",
            context.text
        ))];
        for turn in self
            .tracker
            .recent_turns(conversation_id, self.config.history_turns)
        {
            messages.push(ChatMessage::user(turn.question));
            messages.push(ChatMessage::assistant(turn.answer));
        }
        messages.push(ChatMessage::user(question));
        messages
    }

    /// Remove every chunk of `conversation_id` from the index and forget its history
    ///
    /// Rebuilds the whole index; see [`ConversationVectorIndex::remove_conversation`].
    #[inline]
    pub fn remove_conversation(&self, conversation_id: &str) -> Result<usize> {
        let removed = self
            .index
            .remove_conversation(conversation_id)
            .map_err(|e| e.in_operation("remove conversation", conversation_id))?;
        self.tracker.forget(conversation_id);
        Ok(removed)
    }

    /// Documents attached to `conversation_id`, in the order they were ingested
    #[inline]
    pub fn conversation_documents(&self, conversation_id: &str) -> Vec<DocumentSummary> {
        let mut summaries: HashMap<String, DocumentSummary> = self
            .index
            .document_summaries(conversation_id)
            .into_iter()
            .map(|summary| (summary.document_id.clone(), summary))
            .collect();

        self.tracker
            .documents(conversation_id)
            .iter()
            .filter_map(|document_id| summaries.remove(document_id))
            .collect()
    }
}
