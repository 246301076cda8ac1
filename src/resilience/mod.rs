//! 弹性模式模块：提供熔断器和限流器等可靠性保障机制。
//!
//! # Resilience Primitives Module
//!
//! Admission control for outbound provider calls.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Per-provider failure isolation (CLOSED / OPEN / HALF_OPEN) |
//! | [`rate_limiter`] | Per-(tenant, model) token bucket with a bounded FIFO wait queue |
//!
//! ## Circuit Breaker
//!
//! - **Closed**: requests pass; `failure_threshold` consecutive failures open it
//! - **Open**: requests fail fast until `open_timeout` elapses
//! - **Half-Open**: limited trial calls; successes close it, any failure reopens it
//!
//! ```rust
//! use ai_lib_admission::resilience::circuit_breaker::{CallOutcome, CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let config = CircuitBreakerConfig::new()
//!     .with_failure_threshold(5)
//!     .with_open_timeout(Duration::from_secs(30));
//! let breaker = CircuitBreaker::new("openai", config);
//!
//! if let Ok((permit, _)) = breaker.check() {
//!     // Make API call...
//!     breaker.record(permit, CallOutcome::Success);
//! }
//! # }
//! ```
//!
//! ## Rate Limiter
//!
//! Tokens refill lazily; when the bucket is empty callers queue in FIFO order up
//! to `max_queue_depth`, and further callers are rejected immediately.
//!
//! ```rust
//! use ai_lib_admission::resilience::rate_limiter::{BucketConfig, RateLimitConfig, RateLimiter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let config = RateLimitConfig::new().with_default(
//!     BucketConfig::new().with_capacity(5).with_refill_rate(1.0).with_max_queue_depth(16),
//! );
//! let limiter = RateLimiter::new(config);
//! let admission = limiter.acquire("tenant-a", "openai/gpt-4o", None).await;
//! assert!(admission.is_admitted());
//! # }
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
