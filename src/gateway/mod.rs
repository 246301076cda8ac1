//! 网关主流程：缓存、去重、限流、熔断、批处理与错误分类的组合入口。
//!
//! # Admission Gateway
//!
//! [`Gateway::submit`] is the single entry point. A request flows through:
//!
//! 1. `RequestKeyer` → canonical key
//! 2. `ResponseCache` → a hit returns immediately
//! 3. `InFlightDeduplicator` → followers wait for the leader's outcome
//! 4. `RateLimiter` → token or bounded FIFO wait (leader only)
//! 5. `CircuitBreaker` → fail fast while the provider is open
//! 6. `Batcher` / `ProviderInvoker` → the outbound call
//! 7. `ErrorClassifier` → `HealthTracker` → breaker outcome → cache write
//! 8. the in-flight group resolves every waiter with the same outcome
//!
//! The leader's work runs in its own task, so a leader whose caller goes away
//! still completes the call for its followers and for the cache.
//!
//! ```rust,no_run
//! use ai_lib_admission::gateway::GatewayBuilder;
//! use ai_lib_admission::provider::{InvokeResult, ProviderInvoker, ProviderRequest, ProviderResponse};
//! use ai_lib_admission::types::SubmitRequest;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl ProviderInvoker for Echo {
//!     async fn invoke(&self, request: ProviderRequest) -> InvokeResult {
//!         Ok(ProviderResponse::new(request.payload))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> ai_lib_admission::Result<()> {
//!     let gateway = GatewayBuilder::new(Arc::new(Echo)).build()?;
//!     let response = gateway
//!         .submit(SubmitRequest::new("tenant-a", "openai/gpt-4o", serde_json::json!({"q": 1})))
//!         .await?;
//!     println!("{}", response.body);
//!     Ok(())
//! }
//! ```

mod builder;
mod signals;

pub use builder::GatewayBuilder;
pub use signals::SignalsSnapshot;

use crate::batch::Batcher;
use crate::cache::{CacheBackend, CacheKey, CacheStats, KeyPattern, RequestKeyer, ResponseCache};
use crate::classify::{ErrorClass, ErrorClassifier};
use crate::config::GatewayConfig;
use crate::dedup::{InFlightDeduplicator, Join, LeaderGuard};
use crate::health::{HealthSnapshot, HealthTracker};
use crate::provider::{ProviderInvoker, ProviderResponse};
use crate::resilience::circuit_breaker::{CallOutcome, CircuitBreakers, Transition};
use crate::resilience::rate_limiter::{Admission, RateLimiter};
use crate::telemetry::{record_quietly, MetricAttributes, MetricEvent, MetricsSink};
use crate::types::{RequestEnvelope, SubmitRequest};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::time::Instant;

/// The request admission and resilience pipeline.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

struct Inner {
    config: GatewayConfig,
    keyer: RequestKeyer,
    cache: ResponseCache,
    dedup: InFlightDeduplicator,
    limiter: RateLimiter,
    breakers: CircuitBreakers,
    batcher: Batcher,
    health: HealthTracker,
    invoker: Arc<dyn ProviderInvoker>,
    sink: Arc<dyn MetricsSink>,
}

impl Gateway {
    pub fn builder(invoker: Arc<dyn ProviderInvoker>) -> GatewayBuilder {
        GatewayBuilder::new(invoker)
    }

    pub(crate) fn assemble(
        config: GatewayConfig,
        keyer: RequestKeyer,
        backend: Arc<dyn CacheBackend>,
        invoker: Arc<dyn ProviderInvoker>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let inner = Inner {
            keyer,
            cache: ResponseCache::new(config.cache.clone(), backend),
            dedup: InFlightDeduplicator::new(),
            limiter: RateLimiter::new(config.rate_limit.clone()),
            breakers: CircuitBreakers::new(config.circuit_breaker.clone()),
            batcher: Batcher::new(config.batch.clone(), Arc::clone(&invoker), Arc::clone(&sink)),
            health: HealthTracker::new(config.health.clone()),
            invoker,
            sink,
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Canonical key `request` would be cached and deduplicated under.
    pub fn key_for(&self, request: &SubmitRequest) -> CacheKey {
        self.inner.keyer.canonicalize(
            &request.tenant,
            &request.model,
            &request.payload,
            &request.params,
        )
    }

    /// Runs `request` through the pipeline.
    ///
    /// Concurrent submissions with the same canonical key share one provider call
    /// and observe the same outcome.
    pub async fn submit(&self, request: SubmitRequest) -> Result<ProviderResponse> {
        let inner = &self.inner;
        let env = inner.envelope(request)?;
        if env.is_expired() {
            return Err(Error::timeout("admission"));
        }

        if !env.params.no_cache() {
            if let Some(hit) = inner.cache.get(&env.key).await {
                tracing::debug!(tenant = %env.tenant, model = %env.model, key = %env.key, "cache hit");
                inner.emit(MetricEvent::CacheHit, inner.attrs(&env));
                return Ok(hit);
            }
            tracing::debug!(tenant = %env.tenant, model = %env.model, key = %env.key, "cache miss");
            inner.emit(MetricEvent::CacheMiss, inner.attrs(&env));
        }

        let outcome = match inner.dedup.join(&env.key) {
            Join::Leader(guard) => {
                inner.emit(MetricEvent::DedupLeader, inner.attrs(&env));
                let own = guard.subscribe();
                tokio::spawn(Arc::clone(inner).lead(env, guard));
                // The leader task is bounded by the same deadline and always resolves.
                own.wait(None).await
            }
            Join::Follower(handle) => {
                tracing::debug!(tenant = %env.tenant, key = %env.key, "joined in-flight call");
                inner.emit(MetricEvent::DedupFollower, inner.attrs(&env));
                handle.wait(env.deadline).await
            }
        };
        outcome.map(|resp| (*resp).clone())
    }

    /// Removes cache entries matching `pattern`; returns how many were removed.
    pub async fn invalidate(&self, pattern: &KeyPattern) -> Result<usize> {
        let removed = self.inner.cache.invalidate(pattern).await?;
        self.inner.emit(
            MetricEvent::CacheInvalidate,
            MetricAttributes::new()
                .with("pattern", pattern)
                .with("removed", removed),
        );
        Ok(removed)
    }

    /// Rolling health for `provider`, with its current breaker state.
    pub fn get_provider_health(&self, provider: &str) -> HealthSnapshot {
        let breaker = self.inner.breakers.snapshot(provider).map(|s| s.state);
        self.inner.health.snapshot(provider).with_breaker(breaker)
    }

    /// Health for every provider that has been called.
    pub fn provider_health(&self) -> Vec<HealthSnapshot> {
        let mut providers = self.inner.health.providers();
        providers.sort();
        providers
            .iter()
            .map(|p| self.get_provider_health(p))
            .collect()
    }

    pub fn signals(&self) -> SignalsSnapshot {
        let inner = &self.inner;
        SignalsSnapshot {
            inflight: inner.dedup.snapshot(),
            rate_limiters: inner.limiter.snapshots(),
            circuit_breakers: inner.breakers.snapshots(),
            batch: inner.batcher.snapshot(),
            cache: inner.cache.stats(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }
}

impl Inner {
    fn envelope(&self, request: SubmitRequest) -> Result<RequestEnvelope> {
        if request.tenant.is_empty() {
            return Err(Error::MalformedRequest {
                message: "tenant must not be empty".into(),
            });
        }
        if request.model.is_empty() {
            return Err(Error::MalformedRequest {
                message: "model must not be empty".into(),
            });
        }
        let key = self.keyer.canonicalize(
            &request.tenant,
            &request.model,
            &request.payload,
            &request.params,
        );
        Ok(RequestEnvelope {
            id: request
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            provider: self.invoker.provider_for(&request.model),
            tenant: request.tenant,
            model: request.model,
            key,
            payload: request.payload,
            params: request.params,
            priority: request.priority,
            submitted_at: Instant::now(),
            deadline: request.deadline,
        })
    }

    fn attrs(&self, env: &RequestEnvelope) -> MetricAttributes {
        MetricAttributes::new()
            .with("tenant", &env.tenant)
            .with("model", &env.model)
            .with("provider", &env.provider)
            .with("priority", env.priority.as_str())
    }

    fn emit(&self, event: MetricEvent, attributes: MetricAttributes) {
        record_quietly(self.sink.as_ref(), event, &attributes);
    }

    fn emit_transition(&self, t: Option<Transition>) {
        if let Some(t) = t {
            self.emit(
                MetricEvent::BreakerTransition,
                MetricAttributes::new()
                    .with("provider", &t.provider)
                    .with("from", t.from.as_str())
                    .with("to", t.to.as_str()),
            );
        }
    }

    async fn lead(self: Arc<Self>, env: RequestEnvelope, guard: LeaderGuard) {
        let outcome = match self.recheck_cache(&env).await {
            Some(hit) => Ok(hit),
            None => self.execute(&env).await,
        };
        let followers = guard.resolve(outcome.map(Arc::new));
        if followers > 0 {
            tracing::debug!(
                key = %env.key,
                followers,
                elapsed_ms = env.elapsed().as_millis() as u64,
                "resolved in-flight group"
            );
        }
    }

    /// A previous leader may have filled the cache between our miss and our join.
    async fn recheck_cache(&self, env: &RequestEnvelope) -> Option<ProviderResponse> {
        if env.params.no_cache() {
            return None;
        }
        let hit = self.cache.peek(&env.key).await?;
        tracing::debug!(tenant = %env.tenant, key = %env.key, "cache filled while joining");
        self.emit(MetricEvent::CacheHit, self.attrs(env));
        Some(hit)
    }

    async fn execute(&self, env: &RequestEnvelope) -> Result<ProviderResponse> {
        let admission = self
            .limiter
            .acquire(&env.tenant, &env.model, env.deadline)
            .await;
        match &admission {
            Admission::Admitted { waited } => self.emit(
                MetricEvent::RateLimitAdmitted,
                self.attrs(env).with("waited_ms", waited.as_millis()),
            ),
            Admission::Rejected(reason) => self.emit(
                MetricEvent::RateLimitRejected,
                self.attrs(env).with("reason", reason.as_str()),
            ),
        }
        admission.into_result(&env.tenant, &env.model)?;

        let breaker = self.breakers.get(&env.provider);
        let permit = match breaker.check_guarded() {
            Ok((permit, transition)) => {
                self.emit_transition(transition);
                permit
            }
            Err(e) => {
                self.emit(MetricEvent::BreakerRejected, self.attrs(env));
                return Err(e);
            }
        };

        let started = Instant::now();
        let result = self
            .batcher
            .call(env.provider_request(), env.deadline)
            .await;
        let latency_ms = started.elapsed().as_millis();

        match result {
            Ok(Ok(response)) => {
                self.health.record_success(&env.provider);
                self.emit_transition(permit.record(CallOutcome::Success));
                self.emit(
                    MetricEvent::ProviderSuccess,
                    self.attrs(env).with("latency_ms", latency_ms),
                );
                if self.cache.is_cacheable(&env.params, &response)
                    && self.cache.put(&env.key, &response).await
                {
                    self.emit(MetricEvent::CacheWrite, self.attrs(env));
                }
                Ok(response)
            }
            Ok(Err(raw)) => {
                let class = ErrorClassifier::classify(&raw);
                tracing::debug!(provider = %env.provider, class = class.name(), error = %raw, "provider call failed");
                self.health.record_error(&env.provider, class, raw.to_string());
                let outcome = if class.counts_against_provider() {
                    CallOutcome::Failure
                } else {
                    CallOutcome::Neutral
                };
                self.emit_transition(permit.record(outcome));
                self.emit(
                    MetricEvent::ProviderFailure,
                    self.attrs(env)
                        .with("class", class.name())
                        .with("latency_ms", latency_ms),
                );
                Err(ErrorClassifier::into_error(&env.provider, class, &raw))
            }
            Err(e) if e.counts_against_provider() => {
                self.health
                    .record_error(&env.provider, ErrorClass::Retryable, e.to_string());
                self.emit_transition(permit.record(CallOutcome::Failure));
                self.emit(
                    MetricEvent::ProviderFailure,
                    self.attrs(env).with("class", e.code()),
                );
                Err(e)
            }
            Err(e) => {
                // Local wait expired or the batch broke; the provider is not at fault.
                tracing::debug!(provider = %env.provider, error = %e, "call ended before the provider answered");
                self.emit_transition(permit.record(CallOutcome::Neutral));
                Err(e)
            }
        }
    }
}
