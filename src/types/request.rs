//! Request-side types: parameters, priority, submissions and envelopes.

use crate::cache::CacheKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Request payload as handed to the provider (messages, prompt, input, ...).
pub type Payload = Value;

/// Parameters that never change what the provider returns and are therefore
/// excluded from canonical keys and batch compatibility.
pub const NON_SEMANTIC_PARAMS: &[&str] = &["batchable", "no_cache", "request_id", "metadata"];

/// Sampling and control parameters for a request.
///
/// Stored in a `BTreeMap` so iteration order is independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestParams(BTreeMap<String, Value>);

impl RequestParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn temperature(&self) -> Option<f64> {
        self.0.get("temperature").and_then(Value::as_f64)
    }

    pub fn is_streaming(&self) -> bool {
        self.flag("stream")
    }

    /// Explicit `no_cache` directive from the caller.
    pub fn no_cache(&self) -> bool {
        self.flag("no_cache")
    }

    /// Caller opted into opportunistic batching.
    pub fn batchable(&self) -> bool {
        self.flag("batchable")
    }

    /// Parameters that influence the provider result, in key order.
    pub fn semantic(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0
            .iter()
            .filter(|(k, _)| !NON_SEMANTIC_PARAMS.contains(&k.as_str()))
    }

    fn flag(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

impl FromIterator<(String, Value)> for RequestParams {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Caller-declared priority. Reported in metrics; admission stays FIFO per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

/// Inbound request as supplied by a caller of `Gateway::submit`.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub id: Option<String>,
    pub tenant: String,
    /// Model reference in `provider/model` form.
    pub model: String,
    pub payload: Payload,
    pub params: RequestParams,
    pub priority: Priority,
    pub deadline: Option<Instant>,
}

impl SubmitRequest {
    pub fn new(tenant: impl Into<String>, model: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: None,
            tenant: tenant.into(),
            model: model.into(),
            payload,
            params: RequestParams::new(),
            priority: Priority::Normal,
            deadline: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_params(mut self, params: RequestParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key, value);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }
}

/// A request owned by the pipeline from keying until its result is delivered.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub id: String,
    pub tenant: String,
    pub model: String,
    pub provider: String,
    pub key: CacheKey,
    pub payload: Payload,
    pub params: RequestParams,
    pub priority: Priority,
    pub submitted_at: Instant,
    pub deadline: Option<Instant>,
}

impl RequestEnvelope {
    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    pub fn elapsed(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    pub fn provider_request(&self) -> crate::provider::ProviderRequest {
        crate::provider::ProviderRequest {
            request_id: self.id.clone(),
            model: self.model.clone(),
            payload: self.payload.clone(),
            params: self.params.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_params_flags() {
        let params = RequestParams::new()
            .with("temperature", 0.0)
            .with("stream", true)
            .with("batchable", true);
        assert_eq!(params.temperature(), Some(0.0));
        assert!(params.is_streaming());
        assert!(params.batchable());
        assert!(!params.no_cache());
    }

    #[test]
    fn test_semantic_params_skip_control_flags() {
        let params = RequestParams::new()
            .with("max_tokens", 64)
            .with("no_cache", true)
            .with("metadata", json!({"trace": "abc"}));
        let keys: Vec<&str> = params.semantic().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["max_tokens"]);
    }

    #[test]
    fn test_params_deserialize_from_object() {
        let params: RequestParams =
            serde_json::from_value(json!({"top_p": 0.9, "temperature": 0.2})).unwrap();
        assert_eq!(params.get("top_p"), Some(&json!(0.9)));
    }

    #[test]
    fn test_submit_request_builder() {
        let req = SubmitRequest::new("t1", "openai/gpt-4o", json!({"prompt": "hi"}))
            .with_id("req-1")
            .with_param("temperature", 0)
            .with_priority(Priority::High);
        assert_eq!(req.id.as_deref(), Some("req-1"));
        assert_eq!(req.priority.as_str(), "high");
        assert!(req.deadline.is_none());
    }
}
