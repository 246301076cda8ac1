//! Outbound provider boundary.
//!
//! The pipeline never builds provider-specific request bodies. It hands a
//! [`ProviderRequest`] to a [`ProviderInvoker`] supplied at construction time and
//! gets back either a [`ProviderResponse`] or a [`RawError`] to classify.

use crate::types::{Payload, RequestParams};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single call as seen by the provider adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub request_id: String,
    pub model: String,
    pub payload: Payload,
    pub params: RequestParams,
}

/// Successful provider result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub body: Value,
    /// Provider asked for the result not to be stored (e.g. `Cache-Control: no-store`).
    #[serde(default)]
    pub no_store: bool,
}

impl ProviderResponse {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            no_store: false,
        }
    }

    pub fn with_no_store(mut self, no_store: bool) -> Self {
        self.no_store = no_store;
        self
    }
}

/// Transport-level failure observed before any HTTP status was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportFailure {
    Timeout,
    Connect,
    Reset,
}

/// Unclassified provider failure as reported by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawError {
    pub status: Option<u16>,
    /// Provider error code or type (e.g. `"invalid_api_key"`, `"overloaded_error"`).
    pub code: Option<String>,
    pub message: String,
    pub retry_after_ms: Option<u64>,
    pub transport: Option<TransportFailure>,
}

impl RawError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: None,
            message: message.into(),
            retry_after_ms: None,
            transport: None,
        }
    }

    pub fn transport(kind: TransportFailure, message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
            retry_after_ms: None,
            transport: Some(kind),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }
}

impl std::fmt::Display for RawError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.status, &self.code) {
            (Some(s), Some(c)) => write!(f, "HTTP {} ({}): {}", s, c, self.message),
            (Some(s), None) => write!(f, "HTTP {}: {}", s, self.message),
            (None, Some(c)) => write!(f, "{}: {}", c, self.message),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

pub type InvokeResult = std::result::Result<ProviderResponse, RawError>;

/// Performs the actual network call to a model provider.
#[async_trait]
pub trait ProviderInvoker: Send + Sync {
    async fn invoke(&self, request: ProviderRequest) -> InvokeResult;

    /// Issue one call for a batch window; returns one result per member, in order.
    ///
    /// The default fans out to [`invoke`](Self::invoke) concurrently. Adapters with
    /// a native batch endpoint should override this.
    async fn invoke_batch(&self, requests: Vec<ProviderRequest>) -> Vec<InvokeResult> {
        futures::future::join_all(requests.into_iter().map(|r| self.invoke(r))).await
    }

    /// Provider id owning `model`; keys the circuit breaker and health tracker.
    fn provider_for(&self, model: &str) -> String {
        provider_id_for(model).to_string()
    }
}

/// `"openai/gpt-4o"` → `"openai"`; ids without a `/` are their own provider.
pub fn provider_id_for(model: &str) -> &str {
    model.split_once('/').map(|(p, _)| p).unwrap_or(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_id_for() {
        assert_eq!(provider_id_for("openai/gpt-4o"), "openai");
        assert_eq!(provider_id_for("openrouter/meta/llama-3"), "openrouter");
        assert_eq!(provider_id_for("local-model"), "local-model");
    }

    #[test]
    fn test_raw_error_display() {
        let e = RawError::http(401, "bad key").with_code("invalid_api_key");
        assert_eq!(e.to_string(), "HTTP 401 (invalid_api_key): bad key");
        let t = RawError::transport(TransportFailure::Reset, "connection reset");
        assert_eq!(t.to_string(), "connection reset");
    }

    struct Echo;

    #[async_trait]
    impl ProviderInvoker for Echo {
        async fn invoke(&self, request: ProviderRequest) -> InvokeResult {
            Ok(ProviderResponse::new(request.payload))
        }
    }

    #[tokio::test]
    async fn test_default_invoke_batch_preserves_order() {
        let reqs: Vec<ProviderRequest> = (0..3)
            .map(|i| ProviderRequest {
                request_id: format!("r{i}"),
                model: "m/x".into(),
                payload: json!(i),
                params: RequestParams::new(),
            })
            .collect();
        let out = Echo.invoke_batch(reqs).await;
        let bodies: Vec<Value> = out.into_iter().map(|r| r.unwrap().body).collect();
        assert_eq!(bodies, vec![json!(0), json!(1), json!(2)]);
    }
}
