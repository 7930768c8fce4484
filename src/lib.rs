use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    /// Network failure, timeout, HTTP 429 or 5xx. Retried with backoff before surfacing.
    #[error("Transient service error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    TransientService { status: Option<u16>, message: String },

    #[error("Authentication rejected by service: {0}")]
    Auth(String),

    #[error("Service endpoint not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A fallback vector was produced where a real embedding was required.
    #[error("Embedding degraded: {0}")]
    EmbeddingDegraded(String),

    #[error("Index corruption: {0}")]
    IndexCorruption(String),

    #[error("Vector dimension mismatch: index holds {expected}-dimensional vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Chunk/vector count mismatch: {chunks} chunks but {vectors} vectors")]
    LengthMismatch { chunks: usize, vectors: usize },

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{operation} failed for conversation '{conversation_id}': {message}")]
    Operation {
        operation: &'static str,
        conversation_id: String,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// Whether retrying the same request may succeed.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientService { .. })
    }

    /// Attach operation and conversation context to unclassified failures.
    ///
    /// Classified errors (auth, dimension mismatch, ...) pass through untouched so
    /// callers can still match on them.
    #[inline]
    pub fn in_operation(self, operation: &'static str, conversation_id: &str) -> Self {
        match self {
            Self::Io(_) | Self::Json(_) | Self::Other(_) => Self::Operation {
                operation,
                conversation_id: conversation_id.to_string(),
                message: self.to_string(),
            },
            classified => classified,
        }
    }
}

pub mod chunking;
pub mod commands;
pub mod completion;
pub mod config;
pub mod documents;
pub mod embeddings;
pub mod http;
pub mod index;
pub mod pipeline;
pub mod tracker;
