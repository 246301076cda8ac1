//! 厂商健康统计：按厂商维护滑动窗口内的成功/失败计数。
//!
//! # Provider Health
//!
//! [`HealthTracker`] keeps a rolling window of classified outcomes per provider.
//! It is a reporting surface only: it never decides retries or breaker
//! transitions.

use crate::classify::ErrorClass;
use crate::config::duration_ms;
use crate::resilience::circuit_breaker::CircuitState;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Length of the rolling window.
    #[serde(rename = "window_ms", with = "duration_ms")]
    pub window: Duration,
    /// Upper bound on samples kept per provider.
    pub max_samples: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_samples: 1000,
        }
    }
}

impl HealthConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
    pub fn with_max_samples(mut self, n: usize) -> Self {
        self.max_samples = n;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastError {
    pub class: ErrorClass,
    pub message: String,
    pub age_ms: u64,
}

/// Read-only view of one provider's recent health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub provider: String,
    pub window_ms: u64,
    pub successes: u64,
    /// Provider-attributable failures, including provider throttling.
    pub failures: u64,
    /// Malformed and auth failures; excluded from `success_rate`.
    pub client_errors: u64,
    /// `successes / (successes + failures)`; `None` with no samples.
    pub success_rate: Option<f64>,
    pub last_error: Option<LastError>,
    /// Current breaker state, if the provider has a breaker.
    pub breaker: Option<CircuitState>,
}

impl HealthSnapshot {
    fn empty(provider: &str, window: Duration) -> Self {
        Self {
            provider: provider.to_string(),
            window_ms: window.as_millis() as u64,
            successes: 0,
            failures: 0,
            client_errors: 0,
            success_rate: None,
            last_error: None,
            breaker: None,
        }
    }

    pub fn with_breaker(mut self, state: Option<CircuitState>) -> Self {
        self.breaker = state;
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum Sample {
    Success,
    Failure,
    ClientError,
}

#[derive(Debug, Default)]
struct Window {
    samples: VecDeque<(Instant, Sample)>,
    last_error: Option<(ErrorClass, String, Instant)>,
}

impl Window {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_duration_since(*at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct HealthTracker {
    config: HealthConfig,
    providers: DashMap<String, Arc<Mutex<Window>>>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            providers: DashMap::new(),
        }
    }

    fn window(&self, provider: &str) -> Arc<Mutex<Window>> {
        if let Some(w) = self.providers.get(provider) {
            return Arc::clone(w.value());
        }
        Arc::clone(self.providers.entry(provider.to_string()).or_default().value())
    }

    fn push(&self, provider: &str, sample: Sample, error: Option<(ErrorClass, String)>) {
        let window = self.window(provider);
        let mut w = window.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        w.prune(now, self.config.window);
        w.samples.push_back((now, sample));
        while w.samples.len() > self.config.max_samples.max(1) {
            w.samples.pop_front();
        }
        if let Some((class, message)) = error {
            w.last_error = Some((class, message, now));
        }
    }

    pub fn record_success(&self, provider: &str) {
        self.push(provider, Sample::Success, None);
    }

    pub fn record_error(&self, provider: &str, class: ErrorClass, message: impl Into<String>) {
        let sample = if class.is_client_error() {
            Sample::ClientError
        } else {
            Sample::Failure
        };
        self.push(provider, sample, Some((class, message.into())));
    }

    pub fn snapshot(&self, provider: &str) -> HealthSnapshot {
        let mut snap = HealthSnapshot::empty(provider, self.config.window);
        let Some(window) = self.providers.get(provider).map(|w| Arc::clone(w.value())) else {
            return snap;
        };
        let mut w = window.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        w.prune(now, self.config.window);
        for (_, s) in &w.samples {
            match s {
                Sample::Success => snap.successes += 1,
                Sample::Failure => snap.failures += 1,
                Sample::ClientError => snap.client_errors += 1,
            }
        }
        let counted = snap.successes + snap.failures;
        if counted > 0 {
            snap.success_rate = Some(snap.successes as f64 / counted as f64);
        }
        snap.last_error = w.last_error.as_ref().map(|(class, message, at)| LastError {
            class: *class,
            message: message.clone(),
            age_ms: now.saturating_duration_since(*at).as_millis() as u64,
        });
        snap
    }

    /// Providers with at least one recorded outcome.
    pub fn providers(&self) -> Vec<String> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }
}
