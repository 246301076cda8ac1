use crate::batch::BatchSnapshot;
use crate::cache::CacheStats;
use crate::dedup::InflightSnapshot;
use crate::resilience::circuit_breaker::CircuitBreakerSnapshot;
use crate::resilience::rate_limiter::RateLimiterSnapshot;
use serde::Serialize;

/// A point-in-time view of the admission pipeline's shared state.
///
/// Facts only: callers build load-shedding or routing policy on top of these.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SignalsSnapshot {
    pub inflight: InflightSnapshot,
    pub rate_limiters: Vec<RateLimiterSnapshot>,
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
    pub batch: BatchSnapshot,
    pub cache: CacheStats,
}

impl SignalsSnapshot {
    pub fn rate_limiter(&self, tenant: &str, model: &str) -> Option<&RateLimiterSnapshot> {
        self.rate_limiters
            .iter()
            .find(|s| s.tenant == tenant && s.model == model)
    }

    pub fn circuit_breaker(&self, provider: &str) -> Option<&CircuitBreakerSnapshot> {
        self.circuit_breakers.iter().find(|s| s.provider == provider)
    }
}
