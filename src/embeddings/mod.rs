// Embeddings module
// Remote embedding client with caching, rate limiting and fallback-vector containment

pub mod cache;
pub mod client;
pub mod fallback;

pub use cache::{CacheStats, EmbeddingCache, cache_key};
pub use client::{
    Embedder, Embedding, EmbeddingClient, EmbeddingSource, EmbeddingStats, normalize_input,
};
pub use fallback::{FALLBACK_AMPLITUDE, fallback_vector, looks_like_fallback};
