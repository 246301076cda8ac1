use super::Gateway;
use crate::cache::{CacheBackend, MemoryCache, NullCache, RequestKeyer};
use crate::config::GatewayConfig;
use crate::provider::ProviderInvoker;
use crate::telemetry::{noop_sink, MetricsSink};
use crate::Result;
use std::sync::Arc;

/// Builder for a [`Gateway`].
///
/// Only the provider invoker is required; everything else has a default.
pub struct GatewayBuilder {
    invoker: Arc<dyn ProviderInvoker>,
    config: GatewayConfig,
    backend: Option<Arc<dyn CacheBackend>>,
    sink: Arc<dyn MetricsSink>,
    keyer: RequestKeyer,
}

impl GatewayBuilder {
    pub fn new(invoker: Arc<dyn ProviderInvoker>) -> Self {
        Self {
            invoker,
            config: GatewayConfig::default(),
            backend: None,
            sink: noop_sink(),
            keyer: RequestKeyer::new(),
        }
    }

    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Apply `AI_ADMISSION_*` environment overrides on top of the current config.
    pub fn env_overrides(mut self) -> Result<Self> {
        self.config = self.config.apply_env()?;
        Ok(self)
    }

    /// Use a custom cache backend (e.g. a shared remote store).
    ///
    /// Defaults to an in-memory LRU sized from `cache.max_entries` / `cache.max_bytes`.
    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Inject a metrics sink. Default is a no-op sink.
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Keyer used for cache and dedup keys; salt it to isolate deployments sharing a backend.
    pub fn keyer(mut self, keyer: RequestKeyer) -> Self {
        self.keyer = keyer;
        self
    }

    /// Validates the config and assembles the pipeline.
    pub fn build(self) -> Result<Gateway> {
        self.config.validate()?;
        let backend = match self.backend {
            Some(b) => b,
            None if self.config.cache.enabled => Arc::new(MemoryCache::with_limits(
                self.config.cache.max_entries,
                self.config.cache.max_bytes,
            )),
            None => Arc::new(NullCache),
        };
        tracing::debug!(
            backend = backend.name(),
            batching = self.config.batch.enabled,
            rate_limit = self.config.rate_limit.enabled,
            "building admission gateway"
        );
        Ok(Gateway::assemble(
            self.config,
            self.keyer,
            backend,
            self.invoker,
            self.sink,
        ))
    }
}
