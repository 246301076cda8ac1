//! Per-(tenant, model) token buckets with a bounded FIFO wait queue.

use crate::config::duration_ms;
use crate::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Maximum burst size (tokens).
    pub capacity: u32,
    /// Tokens per second.
    pub refill_rate: f64,
    /// Waiters allowed behind an empty bucket before `QueueFull`.
    pub max_queue_depth: usize,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_rate: 10.0,
            max_queue_depth: 64,
        }
    }
}

impl BucketConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum tokens (burst size)
    pub fn with_capacity(mut self, tokens: u32) -> Self {
        self.capacity = tokens;
        self
    }

    /// Set the refill rate (tokens per second)
    pub fn with_refill_rate(mut self, rate: f64) -> Self {
        self.refill_rate = rate;
        self
    }

    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }
}

/// Bucket settings for one tenant, optionally narrowed to one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketOverride {
    pub tenant: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(flatten)]
    pub bucket: BucketConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub default: BucketConfig,
    pub overrides: Vec<BucketOverride>,
    /// Wait bound applied when the caller gives no deadline.
    #[serde(rename = "default_max_wait_ms", with = "duration_ms")]
    pub default_max_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default: BucketConfig::default(),
            overrides: Vec::new(),
            default_max_wait: Duration::from_secs(30),
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_default(mut self, bucket: BucketConfig) -> Self {
        self.default = bucket;
        self
    }

    pub fn with_override(
        mut self,
        tenant: impl Into<String>,
        model: Option<&str>,
        bucket: BucketConfig,
    ) -> Self {
        self.overrides.push(BucketOverride {
            tenant: tenant.into(),
            model: model.map(str::to_string),
            bucket,
        });
        self
    }

    pub fn with_default_max_wait(mut self, wait: Duration) -> Self {
        self.default_max_wait = wait;
        self
    }

    /// Most specific match wins: (tenant, model), then (tenant, any), then the default.
    pub fn bucket_for(&self, tenant: &str, model: &str) -> &BucketConfig {
        let mut tenant_wide = None;
        for o in self.overrides.iter().filter(|o| o.tenant == tenant) {
            match o.model.as_deref() {
                Some(m) if m == model => return &o.bucket,
                None if tenant_wide.is_none() => tenant_wide = Some(&o.bucket),
                _ => {}
            }
        }
        tenant_wide.unwrap_or(&self.default)
    }
}

/// Token bucket with lazy refill: `tokens = min(capacity, tokens + elapsed * rate)`.
///
/// Tokens never go negative and never exceed capacity.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket as of `now`.
    pub fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        let capacity = capacity as f64;
        Self {
            capacity,
            refill_rate: if refill_rate.is_finite() {
                refill_rate.max(0.0)
            } else {
                0.0
            },
            tokens: capacity,
            last_refill: now,
        }
    }

    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Refills, then consumes one token if available.
    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one whole token exists, from the last refill. `None` if it never will.
    pub fn time_until_token(&self) -> Option<Duration> {
        if self.tokens >= 1.0 {
            return Some(Duration::ZERO);
        }
        if self.refill_rate <= 0.0 || self.capacity < 1.0 {
            return None;
        }
        Some(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate))
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    QueueFull { depth: usize },
    Timeout { waited: Duration },
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::QueueFull { .. } => "queue_full",
            RejectReason::Timeout { .. } => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted { waited: Duration },
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }

    pub fn into_result(self, tenant: &str, model: &str) -> Result<Duration> {
        match self {
            Admission::Admitted { waited } => Ok(waited),
            Admission::Rejected(RejectReason::QueueFull { depth }) => Err(Error::QueueFull {
                tenant: tenant.to_string(),
                model: model.to_string(),
                depth,
            }),
            Admission::Rejected(RejectReason::Timeout { waited }) => Err(Error::RateLimitTimeout {
                tenant: tenant.to_string(),
                model: model.to_string(),
                waited_ms: waited.as_millis() as u64,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterSnapshot {
    pub tenant: String,
    pub model: String,
    pub capacity: f64,
    pub refill_rate: f64,
    pub tokens: f64,
    pub queue_depth: usize,
    /// Estimated wait time until a token is available (ms), if currently empty.
    pub estimated_wait_ms: Option<u64>,
}

struct BucketState {
    bucket: TokenBucket,
    queue: VecDeque<u64>,
    next_ticket: u64,
}

struct Bucket {
    cfg: BucketConfig,
    state: Mutex<BucketState>,
    /// Signalled whenever the head of the queue changes.
    head_changed: Notify,
}

impl Bucket {
    fn new(cfg: BucketConfig) -> Self {
        let bucket = TokenBucket::new(cfg.capacity, cfg.refill_rate, Instant::now());
        Self {
            cfg,
            state: Mutex::new(BucketState {
                bucket,
                queue: VecDeque::new(),
                next_ticket: 0,
            }),
            head_changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes its ticket from the queue unless admission disarmed it.
struct QueueSlot {
    bucket: Arc<Bucket>,
    ticket: u64,
    armed: bool,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut st = self.bucket.lock();
            let ticket = self.ticket;
            st.queue.retain(|t| *t != ticket);
        }
        self.bucket.head_changed.notify_waiters();
    }
}

/// Admission gate keyed by (tenant, model).
///
/// Each bucket has its own lock; unrelated keys never contend.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<(String, String), Arc<Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn bucket(&self, tenant: &str, model: &str) -> Arc<Bucket> {
        if let Some(b) = self.buckets.get(&(tenant.to_string(), model.to_string())) {
            return Arc::clone(b.value());
        }
        let cfg = self.config.bucket_for(tenant, model).clone();
        Arc::clone(
            self.buckets
                .entry((tenant.to_string(), model.to_string()))
                .or_insert_with(|| Arc::new(Bucket::new(cfg)))
                .value(),
        )
    }

    /// Acquire one token, waiting in FIFO order up to `deadline`.
    ///
    /// Without a deadline the configured `default_max_wait` applies.
    pub async fn acquire(&self, tenant: &str, model: &str, deadline: Option<Instant>) -> Admission {
        if !self.config.enabled {
            return Admission::Admitted {
                waited: Duration::ZERO,
            };
        }
        let started = Instant::now();
        let deadline = deadline.unwrap_or(started + self.config.default_max_wait);
        let bucket = self.bucket(tenant, model);

        let ticket = {
            let mut st = bucket.lock();
            if st.queue.is_empty() && st.bucket.try_take(started) {
                return Admission::Admitted {
                    waited: Duration::ZERO,
                };
            }
            if st.queue.len() >= bucket.cfg.max_queue_depth {
                tracing::warn!(tenant, model, depth = st.queue.len(), "rate limit queue full");
                return Admission::Rejected(RejectReason::QueueFull {
                    depth: st.queue.len(),
                });
            }
            let t = st.next_ticket;
            st.next_ticket += 1;
            st.queue.push_back(t);
            t
        };
        let mut slot = QueueSlot {
            bucket: Arc::clone(&bucket),
            ticket,
            armed: true,
        };
        tracing::debug!(tenant, model, ticket, "queued for rate limit token");

        loop {
            let notified = bucket.head_changed.notified();
            tokio::pin!(notified);

            let wake_at = {
                let mut st = bucket.lock();
                let now = Instant::now();
                if st.queue.front() == Some(&ticket) {
                    if st.bucket.try_take(now) {
                        st.queue.pop_front();
                        slot.armed = false;
                        drop(st);
                        bucket.head_changed.notify_waiters();
                        return Admission::Admitted {
                            waited: now.saturating_duration_since(started),
                        };
                    }
                    st.bucket
                        .time_until_token()
                        .map(|d| (now + d).min(deadline))
                        .unwrap_or(deadline)
                } else {
                    deadline
                }
            };

            if Instant::now() >= deadline {
                // slot drop dequeues and wakes the next waiter
                return Admission::Rejected(RejectReason::Timeout {
                    waited: started.elapsed(),
                });
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    pub fn snapshot(&self, tenant: &str, model: &str) -> Option<RateLimiterSnapshot> {
        let bucket = self
            .buckets
            .get(&(tenant.to_string(), model.to_string()))
            .map(|b| Arc::clone(b.value()))?;
        Some(Self::snapshot_of(tenant, model, &bucket))
    }

    pub fn snapshots(&self) -> Vec<RateLimiterSnapshot> {
        self.buckets
            .iter()
            .map(|e| Self::snapshot_of(&e.key().0, &e.key().1, e.value()))
            .collect()
    }

    fn snapshot_of(tenant: &str, model: &str, bucket: &Bucket) -> RateLimiterSnapshot {
        let mut st = bucket.lock();
        st.bucket.refill(Instant::now());
        let estimated_wait_ms = if st.bucket.tokens() < 1.0 || !st.queue.is_empty() {
            st.bucket
                .time_until_token()
                .map(|d| d.as_millis() as u64)
        } else {
            None
        };
        RateLimiterSnapshot {
            tenant: tenant.to_string(),
            model: model.to_string(),
            capacity: st.bucket.capacity(),
            refill_rate: st.bucket.refill_rate(),
            tokens: st.bucket.tokens(),
            queue_depth: st.queue.len(),
            estimated_wait_ms,
        }
    }
}
