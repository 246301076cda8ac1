//! 响应缓存模块：规范化请求键与可插拔缓存后端。
//!
//! # Response Caching Module
//!
//! Canonical request keys plus a TTL-bound response cache with pluggable backends.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`RequestKeyer`] | Deterministic `(tenant, model, payload, params)` → [`CacheKey`] |
//! | [`KeyPattern`] | Wildcard pattern for tenant/model scoped invalidation |
//! | [`ResponseCache`] | Cacheability rules, TTL writes and statistics |
//! | [`CacheBackend`] | Trait for in-process or remote storage |
//! | [`MemoryCache`] | In-memory LRU backend bounded by entries and bytes |
//! | [`NullCache`] | No-op backend |
//!
//! ## Example
//!
//! ```rust
//! use ai_lib_admission::cache::{CacheConfig, MemoryCache, RequestKeyer, ResponseCache};
//! use ai_lib_admission::types::RequestParams;
//! use std::sync::Arc;
//!
//! let keyer = RequestKeyer::new();
//! let key = keyer.canonicalize(
//!     "tenant-a",
//!     "openai/gpt-4o",
//!     &serde_json::json!({"messages": []}),
//!     &RequestParams::new().with("temperature", 0),
//! );
//! assert!(key.as_str().starts_with("tenant-a:openai/gpt-4o:"));
//!
//! let cache = ResponseCache::new(CacheConfig::default(), Arc::new(MemoryCache::new(1000)));
//! ```

mod backend;
mod key;
mod manager;

pub use backend::{CacheBackend, CacheEntry, MemoryCache, NullCache};
pub use key::{CacheKey, KeyPattern, RequestKeyer};
pub use manager::{CacheConfig, CacheStats, ResponseCache};
