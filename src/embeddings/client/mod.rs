
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::EmbeddingConfig;
use crate::embeddings::cache::{CacheStats, EmbeddingCache, cache_key};
use crate::embeddings::fallback::{fallback_vector, looks_like_fallback};
use crate::http::{JsonService, RetryPolicy};
use crate::{RagError, Result};

pub const TRUNCATION_MARKER: &str = " [truncated]";
const HEALTH_CHECK_PROBE: &str = "health check";

/// Where a returned vector came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingSource {
    Remote,
    Cache,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub source: EmbeddingSource,
}

impl Embedding {
    /// True when the vector is marked as fallback or carries the fallback signature
    #[inline]
    pub fn is_fallback(&self) -> bool {
        self.source == EmbeddingSource::Fallback || looks_like_fallback(&self.vector)
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// Text-to-vector seam used by the retrieval pipeline
///
/// Implementations contain transient service failures by returning fallback
/// embeddings instead of errors; only non-retryable failures are returned as `Err`.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Embedding>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmbeddingStats {
    pub remote_requests: u64,
    pub fallbacks: u64,
    pub cache: CacheStats,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

/// Client for an OpenAI-compatible `/embeddings` endpoint
#[derive(Debug)]
pub struct EmbeddingClient {
    service: JsonService,
    endpoint: Url,
    model: String,
    batch_size: usize,
    max_input_chars: usize,
    min_request_interval: Duration,
    configured_dimension: usize,
    observed_dimension: AtomicUsize,
    last_request: Mutex<Option<Instant>>,
    cache: EmbeddingCache,
    remote_requests: AtomicU64,
    fallbacks: AtomicU64,
}

impl EmbeddingClient {
    #[inline]
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let endpoint = config
            .embeddings_url()
            .map_err(|e| RagError::Config(e.to_string()))?;

        let retry = RetryPolicy {
            attempts: config.retry_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        };

        Ok(Self {
            service: JsonService::new(
                Duration::from_secs(config.timeout_secs),
                config.api_key.clone(),
                retry,
            ),
            endpoint,
            model: config.model.clone(),
            batch_size: config.batch_size.max(1),
            max_input_chars: config.max_input_chars,
            min_request_interval: Duration::from_millis(config.min_request_interval_ms),
            configured_dimension: config.dimension,
            observed_dimension: AtomicUsize::new(0),
            last_request: Mutex::new(None),
            cache: EmbeddingCache::new(
                config.cache_capacity,
                Duration::from_secs(config.cache_ttl_secs),
            ),
            remote_requests: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.service = self.service.with_timeout(timeout);
        self
    }

    #[inline]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        let retry = RetryPolicy {
            attempts,
            ..self.service.retry_policy()
        };
        self.service = self.service.with_retry(retry);
        self
    }

    #[inline]
    pub fn with_min_request_interval(mut self, interval: Duration) -> Self {
        self.min_request_interval = interval;
        self
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Dimension fallback vectors are generated with: the last real dimension seen,
    /// else the configured one
    #[inline]
    pub fn fallback_dimension(&self) -> usize {
        match self.observed_dimension.load(Ordering::Relaxed) {
            0 => self.configured_dimension,
            observed => observed,
        }
    }

    #[inline]
    pub fn stats(&self) -> EmbeddingStats {
        EmbeddingStats {
            remote_requests: self.remote_requests.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            cache: self.cache.stats(),
        }
    }

    #[inline]
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Embed a probe string, bypassing the cache, and report the service's dimension
    #[inline]
    pub fn health_check(&self) -> Result<usize> {
        debug!("Performing embedding health check against {}", self.endpoint);

        let probe = [HEALTH_CHECK_PROBE.to_string()];
        let vectors = self.request_embeddings(&self.model, &probe)?;
        let vector = vectors.into_iter().next().unwrap_or_default();
        if looks_like_fallback(&vector) {
            return Err(RagError::EmbeddingDegraded(
                "health check returned an empty or zero vector".to_string(),
            ));
        }

        self.observed_dimension
            .store(vector.len(), Ordering::Relaxed);
        info!(
            "Embedding health check passed: model {} returns {}-dimensional vectors",
            self.model,
            vector.len()
        );
        Ok(vector.len())
    }

    #[inline]
    pub fn embed_with_model(&self, text: &str, model: &str) -> Result<Embedding> {
        let mut embeddings = self.embed_batch_with_model(&[text.to_string()], model)?;
        embeddings
            .pop()
            .ok_or_else(|| RagError::InvalidRequest("no embedding produced".to_string()))
    }

    /// Embed `texts` in order, serving duplicates and cached texts without network calls
    #[inline]
    pub fn embed_batch_with_model(&self, texts: &[String], model: &str) -> Result<Vec<Embedding>> {
        let normalized: Vec<String> = texts
            .iter()
            .map(|text| normalize_input(text, self.max_input_chars))
            .collect::<Result<_>>()?;
        let keys: Vec<String> = normalized
            .iter()
            .map(|text| cache_key(model, text))
            .collect();

        let mut resolved: HashMap<&str, Embedding> = HashMap::new();
        for key in &keys {
            if resolved.contains_key(key.as_str()) {
                continue;
            }
            if let Some(vector) = self.cache.get(key) {
                resolved.insert(
                    key.as_str(),
                    Embedding {
                        vector,
                        source: EmbeddingSource::Cache,
                    },
                );
            }
        }

        let misses: Vec<(&str, &String)> = keys
            .iter()
            .zip(&normalized)
            .map(|(key, text)| (key.as_str(), text))
            .filter(|(key, _)| !resolved.contains_key(key))
            .unique_by(|(key, _)| *key)
            .collect();

        debug!(
            "Embedding {} texts: {} cached, {} to request",
            texts.len(),
            resolved.len(),
            misses.len()
        );

        for batch in misses.chunks(self.batch_size) {
            let inputs: Vec<String> = batch.iter().map(|(_, text)| (*text).clone()).collect();
            for ((key, _), embedding) in batch.iter().zip(self.embed_uncached(model, &inputs)?) {
                resolved.insert(*key, embedding);
            }
        }

        keys.iter()
            .map(|key| {
                resolved.get(key.as_str()).cloned().ok_or_else(|| {
                    RagError::InvalidRequest("embedding missing for input".to_string())
                })
            })
            .collect()
    }

    /// Request one batch, replacing unusable results with fallback vectors
    fn embed_uncached(&self, model: &str, inputs: &[String]) -> Result<Vec<Embedding>> {
        let vectors = match self.request_embeddings(model, inputs) {
            Ok(vectors) => vectors,
            Err(error @ (RagError::Auth(_) | RagError::NotFound(_) | RagError::InvalidRequest(_))) => {
                return Err(error);
            }
            Err(error) => {
                warn!(
                    "Embedding request for {} inputs failed, returning fallback vectors: {}",
                    inputs.len(),
                    error
                );
                return Ok(inputs.iter().map(|_| self.fallback()).collect());
            }
        };

        Ok(inputs
            .iter()
            .zip(vectors)
            .map(|(text, vector)| {
                if looks_like_fallback(&vector) {
                    warn!("Service returned an empty or zero vector, using fallback");
                    return self.fallback();
                }
                self.observed_dimension
                    .store(vector.len(), Ordering::Relaxed);
                self.cache.insert(cache_key(model, text), vector.clone());
                Embedding {
                    vector,
                    source: EmbeddingSource::Remote,
                }
            })
            .collect())
    }

    fn request_embeddings(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            input: inputs,
            model,
        };
        let body = serde_json::to_string(&request)?;

        self.throttle();
        self.remote_requests.fetch_add(1, Ordering::Relaxed);
        let response_text = self.service.post_json(&self.endpoint, &body)?;

        let response: EmbeddingResponse = serde_json::from_str(&response_text)?;
        if response.data.len() != inputs.len() {
            return Err(RagError::EmbeddingDegraded(format!(
                "expected {} embeddings, service returned {}",
                inputs.len(),
                response.data.len()
            )));
        }

        let mut data = response.data;
        if data.iter().all(|item| item.index.is_some()) {
            data.sort_by_key(|item| item.index);
        }
        Ok(data.into_iter().map(|item| item.embedding).collect())
    }

    /// Space outbound calls at least `min_request_interval` apart
    fn throttle(&self) {
        let mut last = self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_request_interval {
                let wait = self.min_request_interval - elapsed;
                debug!("Rate limiting embedding request for {:?}", wait);
                std::thread::sleep(wait);
            }
        }
        *last = Some(Instant::now());
    }

    fn fallback(&self) -> Embedding {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        Embedding {
            vector: fallback_vector(self.fallback_dimension()),
            source: EmbeddingSource::Fallback,
        }
    }
}

impl Embedder for EmbeddingClient {
    #[inline]
    fn embed(&self, text: &str) -> Result<Embedding> {
        self.embed_with_model(text, &self.model)
    }

    #[inline]
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        self.embed_batch_with_model(texts, &self.model)
    }
}

/// Collapse whitespace runs and cap the length, marking truncated input
#[inline]
pub fn normalize_input(text: &str, max_chars: usize) -> Result<String> {
    let normalized = text.split_whitespace().join(" ");
    if normalized.is_empty() {
        return Err(RagError::InvalidRequest(
            "cannot embed empty text".to_string(),
        ));
    }

    if normalized.chars().count() <= max_chars {
        return Ok(normalized);
    }

    let keep = max_chars.saturating_sub(TRUNCATION_MARKER.chars().count());
    let mut truncated: String = normalized.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_MARKER);
    debug!(
        "Truncated embedding input from {} to {} characters",
        normalized.chars().count(),
        truncated.chars().count()
    );
    Ok(truncated)
}
