//! 遥测模块：流水线状态转换的即发即弃指标钩子。
//!
//! # Metrics Hook
//!
//! The gateway reports every state transition (cache hit/miss, dedup join,
//! rate-limit rejection, breaker transition, batch flush, provider outcome) to a
//! [`MetricsSink`]. Sinks are fire-and-forget: an error or panic inside a sink is
//! logged and otherwise ignored.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`MetricEvent`] | Kind of transition being reported |
//! | [`MetricAttributes`] | Ordered string attributes (`tenant`, `model`, `provider`, ...) |
//! | [`MetricsSink`] | Trait for metric destinations |
//! | [`NoopMetricsSink`] | Default no-op sink |
//! | [`InMemoryMetricsSink`] | Bounded in-memory sink for tests and the demo binary |
//! | [`TracingMetricsSink`] | Emits each event as a `tracing` event |
//! | [`CompositeMetricsSink`] | Multi-destination composite sink |

use crate::error::ErrorContext;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricEvent {
    CacheHit,
    CacheMiss,
    CacheWrite,
    CacheInvalidate,
    DedupLeader,
    DedupFollower,
    RateLimitAdmitted,
    RateLimitRejected,
    BreakerTransition,
    BreakerRejected,
    BatchFlush,
    ProviderSuccess,
    ProviderFailure,
}

impl MetricEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CacheHit => "cache_hit",
            Self::CacheMiss => "cache_miss",
            Self::CacheWrite => "cache_write",
            Self::CacheInvalidate => "cache_invalidate",
            Self::DedupLeader => "dedup_leader",
            Self::DedupFollower => "dedup_follower",
            Self::RateLimitAdmitted => "rate_limit_admitted",
            Self::RateLimitRejected => "rate_limit_rejected",
            Self::BreakerTransition => "breaker_transition",
            Self::BreakerRejected => "breaker_rejected",
            Self::BatchFlush => "batch_flush",
            Self::ProviderSuccess => "provider_success",
            Self::ProviderFailure => "provider_failure",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MetricAttributes(BTreeMap<String, String>);

impl MetricAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// Destination for pipeline metrics.
///
/// Called inline on the request path; implementations must not block.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricEvent, attributes: &MetricAttributes) -> Result<()>;
}

/// Records into `sink`, swallowing errors and panics.
pub fn record_quietly(sink: &dyn MetricsSink, event: MetricEvent, attributes: &MetricAttributes) {
    match catch_unwind(AssertUnwindSafe(|| sink.record(event, attributes))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(event = event.name(), error = %e, "metrics sink failed"),
        Err(_) => tracing::warn!(event = event.name(), "metrics sink panicked"),
    }
}

/// No-op sink (default).
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record(&self, _event: MetricEvent, _attributes: &MetricAttributes) -> Result<()> {
        Ok(())
    }
}

pub fn noop_sink() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetricsSink)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedMetric {
    pub event: MetricEvent,
    pub attributes: MetricAttributes,
}

/// In-memory sink keeping the most recent `max_events` records.
pub struct InMemoryMetricsSink {
    events: Mutex<VecDeque<RecordedMetric>>,
    counts: Mutex<BTreeMap<MetricEvent, u64>>,
    max_events: usize,
}

impl InMemoryMetricsSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            counts: Mutex::new(BTreeMap::new()),
            max_events: max,
        }
    }

    pub fn events(&self) -> Vec<RecordedMetric> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn events_of(&self, event: MetricEvent) -> Vec<RecordedMetric> {
        self.events()
            .into_iter()
            .filter(|r| r.event == event)
            .collect()
    }

    /// Total records of `event`, including those rotated out of the buffer.
    pub fn count(&self, event: MetricEvent) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .copied()
            .unwrap_or(0)
    }

    pub fn counts(&self) -> BTreeMap<MetricEvent, u64> {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record(&self, event: MetricEvent, attributes: &MetricAttributes) -> Result<()> {
        *self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event)
            .or_insert(0) += 1;
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.push_back(RecordedMetric {
            event,
            attributes: attributes.clone(),
        });
        while events.len() > self.max_events {
            events.pop_front();
        }
        Ok(())
    }
}

/// Forwards every record as a `tracing` debug event.
#[derive(Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, event: MetricEvent, attributes: &MetricAttributes) -> Result<()> {
        let attrs = serde_json::to_string(attributes)?;
        tracing::debug!(target: "ai_lib_admission::metrics", event = event.name(), attributes = %attrs);
        Ok(())
    }
}

/// Composite sink for multiple destinations.
pub struct CompositeMetricsSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl CompositeMetricsSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Default for CompositeMetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for CompositeMetricsSink {
    /// Every sink sees the event, even after one fails or panics; the first error is returned.
    fn record(&self, event: MetricEvent, attributes: &MetricAttributes) -> Result<()> {
        let mut first_err = None;
        for s in &self.sinks {
            let res = catch_unwind(AssertUnwindSafe(|| s.record(event, attributes)))
                .unwrap_or_else(|_| {
                    Err(Error::runtime_with_context(
                        "metrics sink panicked",
                        ErrorContext::new().with_source("metrics"),
                    ))
                });
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;
    impl MetricsSink for Failing {
        fn record(&self, _: MetricEvent, _: &MetricAttributes) -> Result<()> {
            Err(Error::runtime_with_context("sink down", Default::default()))
        }
    }

    struct Panicking;
    impl MetricsSink for Panicking {
        fn record(&self, _: MetricEvent, _: &MetricAttributes) -> Result<()> {
            panic!("boom")
        }
    }

    #[test]
    fn test_in_memory_sink_bounds_and_counts() {
        let sink = InMemoryMetricsSink::new(2);
        let attrs = MetricAttributes::new().with("tenant", "t1");
        sink.record(MetricEvent::CacheMiss, &attrs).unwrap();
        sink.record(MetricEvent::CacheHit, &attrs).unwrap();
        sink.record(MetricEvent::CacheHit, &attrs).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.count(MetricEvent::CacheHit), 2);
        assert_eq!(sink.count(MetricEvent::CacheMiss), 1);
        assert_eq!(sink.events_of(MetricEvent::CacheMiss).len(), 0);
        assert_eq!(sink.events()[0].attributes.get("tenant"), Some("t1"));
        sink.clear();
        assert!(sink.is_empty());
        assert_eq!(sink.count(MetricEvent::CacheHit), 0);
    }

    #[test]
    fn test_composite_reaches_every_sink() {
        let mem = Arc::new(InMemoryMetricsSink::new(10));
        let composite = CompositeMetricsSink::new()
            .add_sink(Arc::new(Failing))
            .add_sink(mem.clone());
        let res = composite.record(MetricEvent::BatchFlush, &MetricAttributes::new());
        assert!(res.is_err());
        assert_eq!(mem.count(MetricEvent::BatchFlush), 1);
    }

    #[test]
    fn test_composite_survives_panicking_sink() {
        let mem = Arc::new(InMemoryMetricsSink::new(10));
        let composite = CompositeMetricsSink::new()
            .add_sink(Arc::new(Panicking))
            .add_sink(mem.clone());
        let err = composite
            .record(MetricEvent::CacheWrite, &MetricAttributes::new())
            .unwrap_err();
        assert!(err.to_string().contains("panicked"));
        assert_eq!(mem.count(MetricEvent::CacheWrite), 1);
    }

    #[test]
    fn test_record_quietly_swallows_failures() {
        let attrs = MetricAttributes::new();
        record_quietly(&Failing, MetricEvent::CacheHit, &attrs);
        record_quietly(&Panicking, MetricEvent::CacheHit, &attrs);
        record_quietly(&TracingMetricsSink, MetricEvent::CacheHit, &attrs.with("k", 1));
    }

    #[test]
    fn test_event_names_match_serde() {
        let json = serde_json::to_string(&MetricEvent::BreakerTransition).unwrap();
        assert_eq!(json, format!("\"{}\"", MetricEvent::BreakerTransition.name()));
    }
}
