//! In-memory LRU tier bounded by entry count and total payload bytes. Entries also
//! expire after the lifetime their key carries.

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use lru::LruCache;
use metrics::counter;
use tracing::debug;

use super::{
    config::CacheConfig, keys::CacheKey, lock::mutex_lock, payload::CachedPayload,
};
use crate::domain::layer::LayerId;

const SOURCE: &str = "cache::memory";
pub(crate) const METRIC_MEMORY_EVICT: &str = "parcelmap_cache_memory_evict_total";

struct MemoryEntry {
    payload: Arc<CachedPayload>,
    expires_at: Instant,
}

struct MemoryState {
    entries: LruCache<CacheKey, MemoryEntry>,
    bytes: usize,
}

/// Outcome of [`MemoryTier::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryInsert {
    Stored { evicted: usize },
    /// Larger than the per-entry limit; served from disk only.
    TooLarge,
}

pub struct MemoryTier {
    state: Mutex<MemoryState>,
    max_bytes: usize,
    entry_limit_bytes: usize,
}

impl MemoryTier {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                entries: LruCache::new(config.memory_max_entries_non_zero()),
                bytes: 0,
            }),
            max_bytes: config.memory_max_bytes,
            entry_limit_bytes: config.memory_entry_limit_bytes,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CachedPayload>> {
        let mut state = mutex_lock(&self.state, SOURCE, "get");
        let entry = state.entries.get(key)?;
        if entry.expires_at > Instant::now() {
            return Some(Arc::clone(&entry.payload));
        }

        if let Some(old) = state.entries.pop(key) {
            state.bytes = state.bytes.saturating_sub(old.payload.len());
        }
        debug!(key = %key, "Dropped expired payload from memory");
        None
    }

    pub fn insert(&self, key: CacheKey, payload: Arc<CachedPayload>) -> MemoryInsert {
        let size = payload.len();
        if size > self.entry_limit_bytes || size > self.max_bytes {
            return MemoryInsert::TooLarge;
        }

        let entry = MemoryEntry {
            payload,
            expires_at: Instant::now() + key.memory_ttl,
        };
        let mut state = mutex_lock(&self.state, SOURCE, "insert");
        let mut evicted = 0;
        state.bytes += size;
        if let Some((old_key, old)) = state.entries.push(key.clone(), entry) {
            state.bytes = state.bytes.saturating_sub(old.payload.len());
            if old_key != key {
                evicted += 1;
            }
        }

        while state.bytes > self.max_bytes {
            let Some((old_key, old)) = state.entries.pop_lru() else {
                break;
            };
            state.bytes = state.bytes.saturating_sub(old.payload.len());
            evicted += 1;
            debug!(key = %old_key, bytes = old.payload.len(), "Evicted payload over byte budget");
        }
        drop(state);

        if evicted > 0 {
            counter!(METRIC_MEMORY_EVICT).increment(evicted as u64);
        }
        MemoryInsert::Stored { evicted }
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut state = mutex_lock(&self.state, SOURCE, "remove");
        match state.entries.pop(key) {
            Some(old) => {
                state.bytes = state.bytes.saturating_sub(old.payload.len());
                true
            }
            None => false,
        }
    }

    /// Drop every payload of one layer; returns how many were removed.
    pub fn remove_layer(&self, layer_id: LayerId) -> usize {
        let mut state = mutex_lock(&self.state, SOURCE, "remove_layer");
        let doomed: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(key, _)| key.layer_id == layer_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            if let Some(old) = state.entries.pop(key) {
                state.bytes = state.bytes.saturating_sub(old.payload.len());
            }
        }
        doomed.len()
    }

    pub fn clear(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "clear");
        state.entries.clear();
        state.bytes = 0;
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "bytes").bytes
    }
}
