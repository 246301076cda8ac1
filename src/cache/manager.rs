//! Response cache over a pluggable backend.

use super::backend::CacheBackend;
use super::key::{CacheKey, KeyPattern};
use crate::config::duration_ms;
use crate::provider::ProviderResponse;
use crate::types::RequestParams;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(rename = "default_ttl_ms", with = "duration_ms")]
    pub default_ttl: Duration,
    pub max_entries: usize,
    pub max_bytes: usize,
    /// Results larger than this are never written.
    pub max_entry_bytes: usize,
    /// Also cache sampled (temperature > 0) results.
    pub cache_sampled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(3600),
            max_entries: 10_000,
            max_bytes: 256 * 1024 * 1024,
            max_entry_bytes: 10 * 1024 * 1024,
            cache_sampled: false,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    pub fn with_max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }
    pub fn with_max_bytes(mut self, n: usize) -> Self {
        self.max_bytes = n;
        self
    }
    pub fn with_cache_sampled(mut self, enabled: bool) -> Self {
        self.cache_sampled = enabled;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub invalidated: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    invalidated: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Maps canonical keys to previously computed results.
///
/// Backend failures never fail a request: reads degrade to a miss, writes are
/// counted and dropped.
pub struct ResponseCache {
    config: CacheConfig,
    backend: Arc<dyn CacheBackend>,
    stats: AtomicStats,
}

impl ResponseCache {
    pub fn new(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            config,
            backend,
            stats: AtomicStats::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// `None` is a miss (including expired or undecodable entries).
    pub async fn get(&self, key: &CacheKey) -> Option<ProviderResponse> {
        self.lookup(key, true).await
    }

    /// Like [`get`](Self::get), but an absent entry is not counted as a miss.
    ///
    /// For second looks at a key whose miss was already counted.
    pub async fn peek(&self, key: &CacheKey) -> Option<ProviderResponse> {
        self.lookup(key, false).await
    }

    async fn lookup(&self, key: &CacheKey, count_miss: bool) -> Option<ProviderResponse> {
        if !self.config.enabled {
            return None;
        }
        let found = match self.backend.get(key.as_str()).await {
            Ok(Some(entry)) => match serde_json::from_slice(&entry.data) {
                Ok(val) => Some(val),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "undecodable cache entry");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %key, backend = self.backend.name(), error = %e, "cache read failed");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                None
            }
        };
        match &found {
            Some(_) => self.stats.hits.fetch_add(1, Ordering::Relaxed),
            None if count_miss => self.stats.misses.fetch_add(1, Ordering::Relaxed),
            None => 0,
        };
        found
    }

    /// Whether `response` to a request with `params` may be stored.
    pub fn is_cacheable(&self, params: &RequestParams, response: &ProviderResponse) -> bool {
        if !self.config.enabled || response.no_store || params.no_cache() || params.is_streaming()
        {
            return false;
        }
        self.config.cache_sampled || params.temperature().map(|t| t == 0.0).unwrap_or(true)
    }

    /// Writes with the default TTL. Returns whether the entry was stored.
    pub async fn put(&self, key: &CacheKey, response: &ProviderResponse) -> bool {
        self.put_with_ttl(key, response, self.config.default_ttl)
            .await
    }

    pub async fn put_with_ttl(
        &self,
        key: &CacheKey,
        response: &ProviderResponse,
        ttl: Duration,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        let data = match serde_json::to_vec(response) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache encode failed");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        if data.len() > self.config.max_entry_bytes {
            return false;
        }
        match self.backend.put(key.as_str(), data, ttl).await {
            Ok(()) => {
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::warn!(key = %key, backend = self.backend.name(), error = %e, "cache write failed");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub async fn invalidate(&self, pattern: &KeyPattern) -> Result<usize> {
        let removed = self.backend.delete_pattern(pattern).await.map_err(|e| {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            e
        })?;
        self.stats
            .invalidated
            .fetch_add(removed as u64, Ordering::Relaxed);
        tracing::debug!(pattern = %pattern, removed, "cache invalidated");
        Ok(removed)
    }

    pub async fn len(&self) -> Result<usize> {
        self.backend.len().await
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, RequestKeyer};
    use crate::cache::backend::CacheEntry;
    use async_trait::async_trait;
    use serde_json::json;

    fn cache() -> ResponseCache {
        ResponseCache::new(CacheConfig::default(), Arc::new(MemoryCache::new(100)))
    }

    fn key(tenant: &str) -> CacheKey {
        RequestKeyer::new().canonicalize(tenant, "openai/gpt-4o", &json!("q"), &RequestParams::new())
    }

    #[tokio::test]
    async fn test_hit_and_miss_stats() {
        let cache = cache();
        let k = key("t1");
        assert!(cache.get(&k).await.is_none());
        assert!(cache.put(&k, &ProviderResponse::new(json!({"text": "a"}))).await);
        let hit = cache.get(&k).await.unwrap();
        assert_eq!(hit.body, json!({"text": "a"}));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.writes), (1, 1, 1));
        assert_eq!(stats.hit_ratio(), 0.5);
    }

    #[tokio::test]
    async fn test_peek_counts_hits_but_not_misses() {
        let cache = cache();
        let k = key("t1");
        assert!(cache.peek(&k).await.is_none());
        assert_eq!(cache.stats().misses, 0);
        assert!(cache.put(&k, &ProviderResponse::new(json!("a"))).await);
        assert!(cache.peek(&k).await.is_some());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 0));
    }

    #[test]
    fn test_cacheability_rules() {
        let cache = cache();
        let ok = ProviderResponse::new(json!(1));
        assert!(cache.is_cacheable(&RequestParams::new(), &ok));
        assert!(cache.is_cacheable(&RequestParams::new().with("temperature", 0), &ok));
        assert!(!cache.is_cacheable(&RequestParams::new().with("temperature", 0.7), &ok));
        assert!(!cache.is_cacheable(&RequestParams::new().with("stream", true), &ok));
        assert!(!cache.is_cacheable(&RequestParams::new().with("no_cache", true), &ok));
        assert!(!cache.is_cacheable(
            &RequestParams::new(),
            &ProviderResponse::new(json!(1)).with_no_store(true)
        ));

        let sampled = ResponseCache::new(
            CacheConfig::new().with_cache_sampled(true),
            Arc::new(MemoryCache::new(1)),
        );
        assert!(sampled.is_cacheable(&RequestParams::new().with("temperature", 0.7), &ok));
    }

    #[tokio::test]
    async fn test_disabled_cache() {
        let cache = ResponseCache::new(
            CacheConfig::new().with_enabled(false),
            Arc::new(MemoryCache::new(10)),
        );
        let k = key("t1");
        assert!(!cache.put(&k, &ProviderResponse::new(json!(1))).await);
        assert!(cache.get(&k).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_by_tenant() {
        let cache = cache();
        let resp = ProviderResponse::new(json!(1));
        cache.put(&key("t1"), &resp).await;
        cache.put(&key("t2"), &resp).await;
        let removed = cache
            .invalidate(&KeyPattern::tenant("t1").unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get(&key("t1")).await.is_none());
        assert!(cache.get(&key("t2")).await.is_some());
        assert_eq!(cache.stats().invalidated, 1);
    }

    struct Broken;

    #[async_trait]
    impl CacheBackend for Broken {
        async fn get(&self, _: &str) -> Result<Option<CacheEntry>> {
            Err(crate::Error::runtime_with_context("down", Default::default()))
        }
        async fn put(&self, _: &str, _: Vec<u8>, _: Duration) -> Result<()> {
            Err(crate::Error::runtime_with_context("down", Default::default()))
        }
        async fn delete_pattern(&self, _: &KeyPattern) -> Result<usize> {
            Ok(0)
        }
        async fn len(&self) -> Result<usize> {
            Ok(0)
        }
        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_backend_errors_degrade_to_miss() {
        let cache = ResponseCache::new(CacheConfig::default(), Arc::new(Broken));
        let k = key("t1");
        assert!(cache.get(&k).await.is_none());
        assert!(!cache.put(&k, &ProviderResponse::new(json!(1))).await);
        assert_eq!(cache.stats().errors, 2);
    }
}
