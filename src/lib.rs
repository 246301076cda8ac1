//! # ai-lib-admission
//!
//! 面向 AI 网关的请求准入与弹性管线：缓存、去重、限流、熔断与批处理。
//!
//! Request admission and resilience pipeline for AI-Protocol gateways. Every
//! call a caller makes to a model provider passes through one [`Gateway`], which
//! coordinates a response cache, an in-flight deduplicator, per-tenant rate
//! limiting, per-provider circuit breaking and opportunistic batching.
//!
//! ## Guarantees
//!
//! - **At most one in-flight call per canonical key**: concurrent identical
//!   requests share the leader's result or error.
//! - **Bounded waiting**: every blocking point honors the caller's deadline;
//!   a full wait queue is rejected with [`Error::QueueFull`], never a hang.
//! - **Fail fast**: an open circuit rejects with [`Error::CircuitOpen`]
//!   without contacting the provider.
//! - **No internal retries**: errors are classified so callers can decide.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_lib_admission::{GatewayBuilder, GatewayConfig, SubmitRequest};
//! # use ai_lib_admission::provider::{InvokeResult, ProviderInvoker, ProviderRequest, ProviderResponse};
//! # use std::sync::Arc;
//! # struct MyProvider;
//! # #[async_trait::async_trait]
//! # impl ProviderInvoker for MyProvider {
//! #     async fn invoke(&self, r: ProviderRequest) -> InvokeResult { Ok(ProviderResponse::new(r.payload)) }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> ai_lib_admission::Result<()> {
//!     let config = GatewayConfig::from_yaml_file("admission.yaml")?.apply_env()?;
//!     let gateway = GatewayBuilder::new(Arc::new(MyProvider)).config(config).build()?;
//!
//!     let reply = gateway
//!         .submit(SubmitRequest::new("tenant-a", "openai/gpt-4o", serde_json::json!({"messages": []})))
//!         .await?;
//!     println!("{}", reply.body);
//!     println!("{:?}", gateway.get_provider_health("openai"));
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`gateway`] | The pipeline: `submit`, `invalidate`, `get_provider_health`, `signals` |
//! | [`cache`] | Canonical keys, response cache and backends |
//! | [`dedup`] | In-flight deduplication (leader/follower) |
//! | [`resilience`] | Token-bucket rate limiter and circuit breaker |
//! | [`batch`] | Time-boxed request batching |
//! | [`classify`] | Provider error classification |
//! | [`health`] | Rolling per-provider health |
//! | [`telemetry`] | Metrics sink hook |
//! | [`provider`] | Outbound provider boundary |
//! | [`config`] | YAML/env configuration and validation |
//! | [`types`] | Request and envelope types |

pub mod batch;
pub mod cache;
pub mod classify;
pub mod config;
pub mod dedup;
pub mod gateway;
pub mod health;
pub mod provider;
pub mod resilience;
pub mod telemetry;
pub mod types;

// Re-export main types for convenience
pub use config::GatewayConfig;
pub use gateway::{Gateway, GatewayBuilder, SignalsSnapshot};
pub use health::HealthSnapshot;
pub use provider::{ProviderInvoker, ProviderRequest, ProviderResponse, RawError};
pub use telemetry::{MetricEvent, MetricsSink};
pub use types::{Priority, RequestParams, SubmitRequest};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext, PROVIDER_CALL_STAGE};
