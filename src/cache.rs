//! Response cache
//!
//! SHA256-keyed cache over dialogue completions. Busy groups repeat
//! themselves; identical prompts within the TTL reuse the earlier
//! completion instead of re-billing the model.

use moka::future::Cache;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
}

/// Completion cache keyed on message + stable context.
#[derive(Clone)]
pub struct ResponseCache {
    cache: Cache<String, String>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(max_entries: u64, ttl_secs: u64, enabled: bool) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self {
            cache,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            enabled,
        }
    }

    /// Key = SHA256(normalized message + persona + memory block).
    ///
    /// The rolling conversation context is deliberately left out: it
    /// changes on every message and would make every key unique.
    pub fn compute_key(message: &str, persona: &str, memory_block: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(message.to_lowercase().trim().as_bytes());
        hasher.update(persona.as_bytes());
        hasher.update(memory_block.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }

        if let Some(response) = self.cache.get(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("cache hit: {}", &key[..16]);
            Some(response)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub async fn set(&self, key: &str, response: String) {
        if !self.enabled {
            return;
        }
        self.cache.insert(key.to_string(), response).await;
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            entries: self.cache.entry_count(),
            hits,
            misses,
            hit_rate_percent: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }
}
