//! Process-wide prompt and view cache
//!
//! Keyed store shared by the registry: parsed prompts keyed by content
//! hash, registry views keyed by root path. Least-recently-used eviction
//! under a byte cap, with a per-entry TTL as a safety net. Correctness
//! relies on hash-based keying, not the TTL.

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::registry::RegistryView;
use crate::scanner::AgentPrompt;

/// Cache key: `("prompt", content_hash)` or `("view", root_path)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Prompt(String),
    View(PathBuf),
}

/// Key namespace, for prefix invalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNamespace {
    Prompt,
    View,
}

impl CacheKey {
    const fn namespace(&self) -> CacheNamespace {
        match self {
            CacheKey::Prompt(_) => CacheNamespace::Prompt,
            CacheKey::View(_) => CacheNamespace::View,
        }
    }
}

/// Cached value, shared by reference
#[derive(Debug, Clone)]
pub enum CacheValue {
    Prompt(Arc<AgentPrompt>),
    View(Arc<RegistryView>),
}

impl CacheValue {
    /// Convenience accessor for prompt values
    #[must_use]
    pub fn into_prompt(self) -> Option<Arc<AgentPrompt>> {
        match self {
            CacheValue::Prompt(p) => Some(p),
            CacheValue::View(_) => None,
        }
    }

    /// Convenience accessor for view values
    #[must_use]
    pub fn into_view(self) -> Option<Arc<RegistryView>> {
        match self {
            CacheValue::View(v) => Some(v),
            CacheValue::Prompt(_) => None,
        }
    }
}

/// Cache counters
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub entries: usize,
    pub bytes: usize,
}

impl CacheStats {
    /// Hits as a fraction of all lookups; 1.0 when nothing was looked up
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 1.0;
        }
        self.hits as f64 / total as f64
    }
}

struct CacheEntry {
    value: CacheValue,
    size: usize,
    created_at: Instant,
}

struct CacheInner {
    /// Insertion order is recency order: head = coldest, tail = hottest.
    map: IndexMap<CacheKey, CacheEntry>,
    bytes: usize,
    stats: CacheStats,
}

/// LRU + TTL keyed store with a byte-size cap
pub struct PromptCache {
    inner: Mutex<CacheInner>,
    byte_cap: usize,
    ttl: Duration,
}

impl PromptCache {
    #[must_use]
    pub fn new(byte_cap: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: IndexMap::new(),
                bytes: 0,
                stats: CacheStats::default(),
            }),
            byte_cap,
            ttl,
        }
    }

    /// Look up a key, refreshing its recency on hit
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        let mut inner = self.inner.lock();

        let Some(entry) = inner.map.get(key) else {
            inner.stats.misses += 1;
            return None;
        };

        if entry.created_at.elapsed() > self.ttl {
            let removed = inner.map.shift_remove(key);
            if let Some(entry) = removed {
                inner.bytes -= entry.size;
            }
            inner.stats.expired += 1;
            inner.stats.misses += 1;
            inner.stats.entries = inner.map.len();
            inner.stats.bytes = inner.bytes;
            return None;
        }

        // Reinsert at the tail to mark the entry most-recently-used.
        let Some(entry) = inner.map.shift_remove(key) else {
            inner.stats.misses += 1;
            return None;
        };
        let value = entry.value.clone();
        inner.map.insert(key.clone(), entry);
        inner.stats.hits += 1;
        Some(value)
    }

    /// Insert a value, evicting cold entries to stay under the byte cap
    pub fn put(&self, key: CacheKey, value: CacheValue, size_bytes: usize) {
        let mut inner = self.inner.lock();

        if let Some(old) = inner.map.shift_remove(&key) {
            inner.bytes -= old.size;
        }

        if size_bytes > self.byte_cap {
            // A value larger than the whole budget is served uncached.
            tracing::warn!(size_bytes, cap = self.byte_cap, "cache value exceeds byte cap");
            inner.stats.entries = inner.map.len();
            inner.stats.bytes = inner.bytes;
            return;
        }

        while inner.bytes + size_bytes > self.byte_cap {
            let Some((_, evicted)) = inner.map.shift_remove_index(0) else {
                break;
            };
            inner.bytes -= evicted.size;
            inner.stats.evictions += 1;
        }

        inner.map.insert(
            key,
            CacheEntry {
                value,
                size: size_bytes,
                created_at: Instant::now(),
            },
        );
        inner.bytes += size_bytes;
        inner.stats.entries = inner.map.len();
        inner.stats.bytes = inner.bytes;
    }

    /// Drop one key; returns whether it was present
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        match inner.map.shift_remove(key) {
            Some(entry) => {
                inner.bytes -= entry.size;
                inner.stats.entries = inner.map.len();
                inner.stats.bytes = inner.bytes;
                true
            }
            None => false,
        }
    }

    /// Drop every key in a namespace
    pub fn invalidate_prefix(&self, namespace: CacheNamespace) {
        let mut inner = self.inner.lock();
        let mut dropped = 0usize;
        inner.map.retain(|key, entry| {
            if key.namespace() == namespace {
                dropped += entry.size;
                false
            } else {
                true
            }
        });
        inner.bytes -= dropped;
        inner.stats.entries = inner.map.len();
        inner.stats.bytes = inner.bytes;
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.bytes = 0;
        inner.stats.entries = 0;
        inner.stats.bytes = 0;
    }

    /// Emergency eviction: drop coldest entries until usage is at or below
    /// `fraction` of the byte cap
    pub fn shrink_to(&self, fraction: f64) {
        let target = (self.byte_cap as f64 * fraction) as usize;
        let mut inner = self.inner.lock();
        while inner.bytes > target {
            let Some((_, evicted)) = inner.map.shift_remove_index(0) else {
                break;
            };
            inner.bytes -= evicted.size;
            inner.stats.evictions += 1;
        }
        inner.stats.entries = inner.map.len();
        inner.stats.bytes = inner.bytes;
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::AgentMetadata;
    use crate::walker::Tier;
    use pretty_assertions::assert_eq;
    use std::collections::{BTreeMap, BTreeSet};

    fn prompt(id: &str, body: &str) -> Arc<AgentPrompt> {
        Arc::new(AgentPrompt {
            id: id.to_string(),
            prompt: body.to_string(),
            metadata: AgentMetadata {
                id: id.to_string(),
                tier: Tier::User,
                source_path: PathBuf::from(format!("/tmp/{id}.md")),
                capabilities: BTreeSet::new(),
                keywords: BTreeSet::new(),
                role_summary: String::new(),
                specializations: BTreeSet::new(),
                version: None,
                extra: BTreeMap::new(),
                content_hash: format!("hash-{id}"),
            },
        })
    }

    fn put_prompt(cache: &PromptCache, id: &str, size: usize) {
        cache.put(
            CacheKey::Prompt(format!("hash-{id}")),
            CacheValue::Prompt(prompt(id, "body")),
            size,
        );
    }

    #[test]
    fn hit_after_put() {
        let cache = PromptCache::new(1024, Duration::from_secs(600));
        put_prompt(&cache, "qa", 100);

        let value = cache.get(&CacheKey::Prompt("hash-qa".to_string()));
        assert!(value.is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.bytes, 100);
    }

    #[test]
    fn miss_counts() {
        let cache = PromptCache::new(1024, Duration::from_secs(600));
        assert!(cache.get(&CacheKey::Prompt("nope".to_string())).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn lru_evicts_coldest_under_byte_pressure() {
        let cache = PromptCache::new(300, Duration::from_secs(600));
        put_prompt(&cache, "a", 100);
        put_prompt(&cache, "b", 100);
        put_prompt(&cache, "c", 100);

        // Touch "a" so "b" is now coldest.
        assert!(cache.get(&CacheKey::Prompt("hash-a".to_string())).is_some());

        put_prompt(&cache, "d", 100);
        assert!(cache.get(&CacheKey::Prompt("hash-b".to_string())).is_none());
        assert!(cache.get(&CacheKey::Prompt("hash-a".to_string())).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn ttl_expiry_is_a_miss() {
        let cache = PromptCache::new(1024, Duration::from_millis(0));
        put_prompt(&cache, "a", 10);
        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.get(&CacheKey::Prompt("hash-a".to_string())).is_none());
        let stats = cache.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn oversized_value_not_stored() {
        let cache = PromptCache::new(100, Duration::from_secs(600));
        put_prompt(&cache, "big", 1000);
        assert!(cache.get(&CacheKey::Prompt("hash-big".to_string())).is_none());
        assert_eq!(cache.stats().bytes, 0);
    }

    #[test]
    fn invalidate_and_prefix() {
        let cache = PromptCache::new(1024, Duration::from_secs(600));
        put_prompt(&cache, "a", 10);
        put_prompt(&cache, "b", 10);

        assert!(cache.invalidate(&CacheKey::Prompt("hash-a".to_string())));
        assert!(!cache.invalidate(&CacheKey::Prompt("hash-a".to_string())));

        cache.invalidate_prefix(CacheNamespace::Prompt);
        assert!(cache.get(&CacheKey::Prompt("hash-b".to_string())).is_none());
        assert_eq!(cache.stats().bytes, 0);
    }

    #[test]
    fn shrink_to_halves_usage() {
        let cache = PromptCache::new(1000, Duration::from_secs(600));
        for i in 0..10 {
            put_prompt(&cache, &format!("p{i}"), 100);
        }
        assert_eq!(cache.stats().bytes, 1000);

        cache.shrink_to(0.5);
        assert!(cache.stats().bytes <= 500);
        // The hottest entries survive.
        assert!(cache.get(&CacheKey::Prompt("hash-p9".to_string())).is_some());
    }
}
