// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded embedding cache.
//!
//! Entries are keyed by a blake3 hash of `(model_id, text)` and evicted in
//! least-recently-used order. Vectors are handed out as `Arc` clones, so an
//! eviction never invalidates a vector a caller is still reading.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type CacheKey = [u8; 32];

pub const DEFAULT_CAPACITY: usize = 10_000;

/// Hash of the model id and text. The model id is length-prefixed so that
/// `("ab", "c")` and `("a", "bc")` do not collide.
pub fn cache_key(model_id: &str, text: &str) -> CacheKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(model_id.len() as u64).to_le_bytes());
    hasher.update(model_id.as_bytes());
    hasher.update(text.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
    pub hit_rate: f64,
}

/// Thread-safe LRU cache of embedding vectors.
pub struct EmbeddingCache {
    entries: Option<Mutex<LruCache<CacheKey, Arc<Vec<f32>>>>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    /// Create a cache holding at most `capacity` vectors. A capacity of
    /// zero disables caching; every lookup is then a miss.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn shared(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity))
    }

    pub fn get(&self, model_id: &str, text: &str) -> Option<Arc<Vec<f32>>> {
        self.get_by_key(&cache_key(model_id, text))
    }

    fn get_by_key(&self, key: &CacheKey) -> Option<Arc<Vec<f32>>> {
        let found = self
            .entries
            .as_ref()
            .and_then(|entries| entries.lock().get(key).cloned());
        match found {
            Some(vector) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(vector)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, model_id: &str, text: &str, vector: Arc<Vec<f32>>) {
        self.put_by_key(cache_key(model_id, text), vector);
    }

    fn put_by_key(&self, key: CacheKey, vector: Arc<Vec<f32>>) {
        if let Some(entries) = &self.entries {
            entries.lock().put(key, vector);
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .as_ref()
            .map(|entries| entries.lock().len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fraction of lookups that hit, 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
            capacity: self.capacity,
            hit_rate: self.hit_rate(),
        }
    }
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
