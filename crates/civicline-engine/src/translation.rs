//! Translation cache.
//!
//! Shared by every conversation. Entries are immutable once inserted: a
//! concurrent second insert for the same key keeps the first value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use civicline_core::LanguageCode;
use tokio::time::Instant;

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    text: String,
    source: LanguageCode,
    target: LanguageCode,
}

struct CacheEntry {
    value: Arc<str>,
    inserted_at: Instant,
}

/// Collapse whitespace and case so trivially different inputs share an entry.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// TTL-bounded memo of translation results.
pub struct TranslationCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
    pub stats: CacheStats,
}

impl TranslationCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
            stats: CacheStats::default(),
        }
    }

    fn key(text: &str, source: &LanguageCode, target: &LanguageCode) -> CacheKey {
        CacheKey {
            text: normalize_text(text),
            source: source.clone(),
            target: target.clone(),
        }
    }

    /// Cached translation, if present and younger than the TTL.
    pub fn get(&self, text: &str, source: &LanguageCode, target: &LanguageCode) -> Option<Arc<str>> {
        let key = Self::key(text, source, target);
        let now = Instant::now();
        let hit = match self.entries.read() {
            Ok(entries) => entries
                .get(&key)
                .filter(|e| now.duration_since(e.inserted_at) < self.ttl)
                .map(|e| Arc::clone(&e.value)),
            Err(_) => None,
        };
        match hit {
            Some(value) => {
                self.stats.record_hit();
                Some(value)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Insert unless a live entry exists; returns whichever value is cached.
    pub fn insert_if_absent(
        &self,
        text: &str,
        source: &LanguageCode,
        target: &LanguageCode,
        translated: &str,
    ) -> Arc<str> {
        let key = Self::key(text, source, target);
        let now = Instant::now();
        let Ok(mut entries) = self.entries.write() else {
            return Arc::from(translated);
        };

        if let Some(existing) = entries.get(&key) {
            if now.duration_since(existing.inserted_at) < self.ttl {
                return Arc::clone(&existing.value);
            }
        }

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let ttl = self.ttl;
            let before = entries.len();
            entries.retain(|_, e| now.duration_since(e.inserted_at) < ttl);
            let expired = before - entries.len();
            for _ in 0..expired {
                self.stats.record_eviction();
            }
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                    self.stats.record_eviction();
                }
            }
        }

        let value: Arc<str> = Arc::from(translated);
        entries.insert(
            key,
            CacheEntry {
                value: Arc::clone(&value),
                inserted_at: now,
            },
        );
        value
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
