use crate::config::duration_ms;
use crate::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED that open the circuit.
    pub failure_threshold: u32,
    /// Trial successes in HALF_OPEN that close it again.
    pub success_threshold: u32,
    /// Time spent OPEN before a trial call is let through.
    #[serde(rename = "open_timeout_ms", with = "duration_ms")]
    pub open_timeout: Duration,
    /// Concurrent trial calls allowed while HALF_OPEN.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            open_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set how long the circuit stays open
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_half_open_max_calls(mut self, n: u32) -> Self {
        self.half_open_max_calls = n;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerOverride {
    pub provider: String,
    #[serde(flatten)]
    pub breaker: CircuitBreakerConfig,
}

/// Default breaker settings plus per-provider overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub default: CircuitBreakerConfig,
    pub overrides: Vec<BreakerOverride>,
}

impl CircuitBreakerSettings {
    pub fn new(default: CircuitBreakerConfig) -> Self {
        Self {
            default,
            overrides: Vec::new(),
        }
    }

    pub fn with_override(mut self, provider: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        self.overrides.push(BreakerOverride {
            provider: provider.into(),
            breaker: cfg,
        });
        self
    }

    pub fn config_for(&self, provider: &str) -> &CircuitBreakerConfig {
        self.overrides
            .iter()
            .find(|o| o.provider == provider)
            .map(|o| &o.breaker)
            .unwrap_or(&self.default)
    }
}

/// Outcome of a call as reported to the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// Says nothing about provider health (caller error, provider throttling).
    Neutral,
}

/// Issued by [`CircuitBreaker::check`]; hand it back to [`CircuitBreaker::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct BreakerPermit {
    trial: bool,
    generation: u64,
}

impl BreakerPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub provider: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: u64,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
    pub since_transition_ms: u64,
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    last_transition: Instant,
    /// Bumped on every transition; permits from older generations are stale.
    generation: u64,
}

/// Per-provider failure isolation.
///
/// - CLOSED: calls pass; `failure_threshold` consecutive failures open the circuit
/// - OPEN: calls fail fast until `open_timeout` has elapsed
/// - HALF_OPEN: up to `half_open_max_calls` trials; `success_threshold` successes
///   close, any failure reopens
///
/// Never blocks. Only `check` and `record` write `state`.
pub struct CircuitBreaker {
    provider: String,
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            cfg,
            state: Mutex::new(State {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                half_open_in_flight: 0,
                last_transition: Instant::now(),
                generation: 0,
            }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, st: &mut State, to: CircuitState) -> Transition {
        let from = st.state;
        st.state = to;
        st.consecutive_failures = 0;
        st.consecutive_successes = 0;
        st.half_open_in_flight = 0;
        st.last_transition = Instant::now();
        st.generation += 1;
        match to {
            CircuitState::Open => {
                tracing::warn!(provider = %self.provider, from = from.as_str(), "circuit opened")
            }
            CircuitState::HalfOpen => {
                tracing::info!(provider = %self.provider, "circuit half-open, allowing trial call")
            }
            CircuitState::Closed => {
                tracing::info!(provider = %self.provider, from = from.as_str(), "circuit closed")
            }
        }
        Transition {
            provider: self.provider.clone(),
            from,
            to,
        }
    }

    /// Admit or reject a call. A rejection is `Error::CircuitOpen`.
    ///
    /// The returned transition is `Some` when this check moved OPEN → HALF_OPEN.
    pub fn check(&self) -> Result<(BreakerPermit, Option<Transition>)> {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => Ok((
                BreakerPermit {
                    trial: false,
                    generation: st.generation,
                },
                None,
            )),
            CircuitState::Open => {
                let elapsed = st.last_transition.elapsed();
                if elapsed < self.cfg.open_timeout {
                    return Err(Error::CircuitOpen {
                        provider: self.provider.clone(),
                        retry_after_ms: Some((self.cfg.open_timeout - elapsed).as_millis() as u64),
                    });
                }
                let t = self.transition(&mut st, CircuitState::HalfOpen);
                st.half_open_in_flight = 1;
                Ok((
                    BreakerPermit {
                        trial: true,
                        generation: st.generation,
                    },
                    Some(t),
                ))
            }
            CircuitState::HalfOpen => {
                if st.half_open_in_flight >= self.cfg.half_open_max_calls.max(1) {
                    return Err(Error::CircuitOpen {
                        provider: self.provider.clone(),
                        retry_after_ms: None,
                    });
                }
                st.half_open_in_flight += 1;
                Ok((
                    BreakerPermit {
                        trial: true,
                        generation: st.generation,
                    },
                    None,
                ))
            }
        }
    }

    /// [`check`](Self::check), with the permit wrapped in a [`PermitGuard`].
    pub fn check_guarded(self: &Arc<Self>) -> Result<(PermitGuard, Option<Transition>)> {
        let (permit, transition) = self.check()?;
        Ok((
            PermitGuard {
                breaker: Arc::clone(self),
                permit: Some(permit),
            },
            transition,
        ))
    }

    /// Report the outcome of a call admitted by `permit`.
    pub fn record(&self, permit: BreakerPermit, outcome: CallOutcome) -> Option<Transition> {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => match outcome {
                CallOutcome::Success => {
                    st.consecutive_failures = 0;
                    None
                }
                CallOutcome::Failure => {
                    st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                    if st.consecutive_failures >= self.cfg.failure_threshold.max(1) {
                        Some(self.transition(&mut st, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CallOutcome::Neutral => None,
            },
            // Late results of calls admitted before the circuit opened.
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if !permit.trial || permit.generation != st.generation {
                    return None;
                }
                st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
                match outcome {
                    CallOutcome::Failure => Some(self.transition(&mut st, CircuitState::Open)),
                    CallOutcome::Success => {
                        st.consecutive_successes = st.consecutive_successes.saturating_add(1);
                        self.close_if_settled(&mut st)
                    }
                    CallOutcome::Neutral => self.close_if_settled(&mut st),
                }
            }
        }
    }

    /// Closes only once no trial is outstanding, so a racing failure always wins.
    fn close_if_settled(&self, st: &mut State) -> Option<Transition> {
        if st.consecutive_successes >= self.cfg.success_threshold.max(1)
            && st.half_open_in_flight == 0
        {
            Some(self.transition(st, CircuitState::Closed))
        } else {
            None
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let st = self.lock();
        let since = st.last_transition.elapsed();
        let open_remaining_ms = match st.state {
            CircuitState::Open => Some(self.cfg.open_timeout.saturating_sub(since).as_millis() as u64),
            _ => None,
        };
        CircuitBreakerSnapshot {
            provider: self.provider.clone(),
            state: st.state,
            consecutive_failures: st.consecutive_failures,
            consecutive_successes: st.consecutive_successes,
            failure_threshold: self.cfg.failure_threshold,
            success_threshold: self.cfg.success_threshold,
            open_timeout_ms: self.cfg.open_timeout.as_millis() as u64,
            open_remaining_ms,
            since_transition_ms: since.as_millis() as u64,
        }
    }
}

/// A [`BreakerPermit`] that must be resolved with an outcome.
///
/// Dropped without [`record`](PermitGuard::record) (the call panicked or its task
/// was torn down), it records `Failure`, so a trial slot is never leaked.
#[must_use]
pub struct PermitGuard {
    breaker: Arc<CircuitBreaker>,
    permit: Option<BreakerPermit>,
}

impl PermitGuard {
    pub fn is_trial(&self) -> bool {
        self.permit.map(|p| p.is_trial()).unwrap_or(false)
    }

    pub fn record(mut self, outcome: CallOutcome) -> Option<Transition> {
        let permit = self.permit.take()?;
        self.breaker.record(permit, outcome)
    }
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            tracing::warn!(provider = %self.breaker.provider, trial = permit.trial, "call abandoned without an outcome");
            self.breaker.record(permit, CallOutcome::Failure);
        }
    }
}

/// Lazily created breaker per provider id.
pub struct CircuitBreakers {
    settings: CircuitBreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakers {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.get(provider) {
            return Arc::clone(b.value());
        }
        let cfg = self.settings.config_for(provider).clone();
        Arc::clone(
            self.breakers
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(provider, cfg)))
                .value(),
        )
    }

    /// Snapshot of an existing breaker; `None` if the provider was never called.
    pub fn snapshot(&self, provider: &str) -> Option<CircuitBreakerSnapshot> {
        self.breakers.get(provider).map(|b| b.snapshot())
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        self.breakers.iter().map(|b| b.snapshot()).collect()
    }
}
