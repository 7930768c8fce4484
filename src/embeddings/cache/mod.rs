
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache key for a `(model, normalized_text)` pair
#[inline]
pub fn cache_key(model: &str, normalized_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0_u8]);
    hasher.update(normalized_text.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    vector: Vec<f32>,
    inserted_at: Instant,
    generation: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order; entries superseded by a re-insert stay here until skipped
    order: VecDeque<(String, u64)>,
    next_generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Bounded embedding cache with least-recently-inserted eviction and a TTL
///
/// Expired or evicted entries are misses. The cache owns its own lock and is
/// never held while the vector index is locked.
#[derive(Debug)]
pub struct EmbeddingCache {
    capacity: usize,
    ttl: Duration,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl EmbeddingCache {
    #[inline]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let expired = match state.entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.vector.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            debug!("Embedding cache entry expired");
            state.entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    #[inline]
    pub fn insert(&self, key: String, vector: Vec<f32>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let generation = state.next_generation;
        state.next_generation += 1;
        state.order.push_back((key.clone(), generation));
        state.entries.insert(
            key,
            CacheEntry {
                vector,
                inserted_at: Instant::now(),
                generation,
            },
        );

        while state.entries.len() > self.capacity {
            let Some((oldest, oldest_generation)) = state.order.pop_front() else {
                break;
            };
            let current = state
                .entries
                .get(&oldest)
                .is_some_and(|entry| entry.generation == oldest_generation);
            if current {
                state.entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        // Re-inserts leave stale order slots behind; drop them once they dominate
        if state.order.len() > self.capacity.saturating_mul(2) {
            let CacheState { entries, order, .. } = &mut *state;
            order.retain(|(key, generation)| {
                entries
                    .get(key)
                    .is_some_and(|entry| entry.generation == *generation)
            });
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entries.clear();
        state.order.clear();
    }

    #[inline]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
