//! Cache backend implementations.

use super::key::KeyPattern;
use crate::Result;
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// A stored result. Immutable once written.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub data: Vec<u8>,
    pub created_at: Instant,
    pub expires_at: Instant,
    /// Approximate footprint in bytes (key + data).
    pub size: usize,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, data: Vec<u8>, ttl: Duration) -> Self {
        let key = key.into();
        let now = Instant::now();
        let size = key.len() + data.len();
        Self {
            key,
            data,
            created_at: now,
            expires_at: now + ttl,
            size,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Pluggable storage behind the response cache (in-process or remote).
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    /// Removes every entry whose key matches; returns how many were removed.
    async fn delete_pattern(&self, pattern: &KeyPattern) -> Result<usize>;
    async fn len(&self) -> Result<usize>;
    fn name(&self) -> &'static str;
}

struct LruState {
    entries: LruCache<String, CacheEntry>,
    bytes: usize,
}

impl LruState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.pop(key)?;
        self.bytes = self.bytes.saturating_sub(removed.size);
        Some(removed)
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for k in expired {
            self.remove(&k);
        }
    }
}

/// In-process LRU cache bounded by entry count and total bytes.
pub struct MemoryCache {
    state: Mutex<LruState>,
    max_bytes: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self::with_limits(max_entries, usize::MAX)
    }

    pub fn with_limits(max_entries: usize, max_bytes: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(LruState {
                entries: LruCache::new(cap),
                bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Total bytes currently held.
    pub fn bytes(&self) -> usize {
        self.lock().bytes
    }

    fn lock(&self) -> MutexGuard<'_, LruState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut st = self.lock();
        let expired = match st.entries.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.clone())),
            Some(_) => true,
        };
        if expired {
            st.remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let entry = CacheEntry::new(key, value, ttl);
        if entry.size > self.max_bytes {
            tracing::debug!(key, size = entry.size, "entry exceeds cache byte budget, skipped");
            return Ok(());
        }
        let mut st = self.lock();
        st.remove(key);
        st.bytes += entry.size;
        if let Some((_, evicted)) = st.entries.push(key.to_string(), entry) {
            st.bytes = st.bytes.saturating_sub(evicted.size);
        }
        while st.bytes > self.max_bytes {
            match st.entries.pop_lru() {
                Some((_, evicted)) => st.bytes = st.bytes.saturating_sub(evicted.size),
                None => break,
            }
        }
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &KeyPattern) -> Result<usize> {
        let mut st = self.lock();
        let matching: Vec<String> = st
            .entries
            .iter()
            .filter(|(k, _)| pattern.matches(k))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &matching {
            st.remove(k);
        }
        Ok(matching.len())
    }

    async fn len(&self) -> Result<usize> {
        let mut st = self.lock();
        st.purge_expired();
        Ok(st.entries.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Backend that stores nothing; disables caching without changing the pipeline.
pub struct NullCache;

impl NullCache {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for NullCache {
    async fn get(&self, _: &str) -> Result<Option<CacheEntry>> {
        Ok(None)
    }
    async fn put(&self, _: &str, _: Vec<u8>, _: Duration) -> Result<()> {
        Ok(())
    }
    async fn delete_pattern(&self, _: &KeyPattern) -> Result<usize> {
        Ok(0)
    }
    async fn len(&self) -> Result<usize> {
        Ok(0)
    }
    fn name(&self) -> &'static str {
        "null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_cache_roundtrip() {
        let cache = MemoryCache::new(10);
        cache
            .put("t1:m:aa", b"hello".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        let entry = cache.get("t1:m:aa").await.unwrap().unwrap();
        assert_eq!(entry.data, b"hello");
        assert_eq!(entry.size, "t1:m:aa".len() + 5);
        assert!(cache.get("t1:m:bb").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_cache_ttl_expiry() {
        let cache = MemoryCache::new(10);
        cache
            .put("k", b"v".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cache.get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert_eq!(cache.len().await.unwrap(), 0);
        assert_eq!(cache.bytes(), 0);
    }

    #[tokio::test]
    async fn test_memory_cache_evicts_least_recently_used() {
        let cache = MemoryCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.put("a", vec![1], ttl).await.unwrap();
        cache.put("b", vec![2], ttl).await.unwrap();
        // touch "a" so "b" becomes least recently used
        assert!(cache.get("a").await.unwrap().is_some());
        cache.put("c", vec![3], ttl).await.unwrap();
        assert!(cache.get("a").await.unwrap().is_some());
        assert!(cache.get("b").await.unwrap().is_none());
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_cache_byte_budget() {
        // each entry: 1 byte key + 10 bytes data
        let cache = MemoryCache::with_limits(100, 25);
        let ttl = Duration::from_secs(60);
        cache.put("a", vec![0; 10], ttl).await.unwrap();
        cache.put("b", vec![0; 10], ttl).await.unwrap();
        cache.put("c", vec![0; 10], ttl).await.unwrap();
        assert_eq!(cache.len().await.unwrap(), 2);
        assert!(cache.bytes() <= 25);
        assert!(cache.get("a").await.unwrap().is_none());

        // larger than the whole budget: not stored
        cache.put("big", vec![0; 64], ttl).await.unwrap();
        assert!(cache.get("big").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_cache_overwrite_keeps_byte_count() {
        let cache = MemoryCache::new(10);
        let ttl = Duration::from_secs(60);
        cache.put("a", vec![0; 10], ttl).await.unwrap();
        cache.put("a", vec![0; 4], ttl).await.unwrap();
        assert_eq!(cache.bytes(), 5);
    }

    #[tokio::test]
    async fn test_delete_pattern() {
        let cache = MemoryCache::new(10);
        let ttl = Duration::from_secs(60);
        cache.put("t1:m1:x", vec![1], ttl).await.unwrap();
        cache.put("t1:m2:y", vec![1], ttl).await.unwrap();
        cache.put("t2:m1:z", vec![1], ttl).await.unwrap();
        let removed = cache
            .delete_pattern(&KeyPattern::tenant("t1").unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_null_cache() {
        let cache = NullCache::new();
        cache.put("k", vec![1], Duration::from_secs(1)).await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
        assert_eq!(cache.name(), "null");
    }
}
