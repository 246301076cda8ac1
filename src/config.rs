//! 网关配置：YAML 加载、环境变量覆盖与校验。
//!
//! # Gateway Configuration
//!
//! All pipeline settings in one immutable [`GatewayConfig`], built in code with
//! `with_*` builders or loaded from YAML. Durations are written as `*_ms`
//! integers.
//!
//! ```yaml
//! cache:
//!   default_ttl_ms: 600000
//!   max_entries: 5000
//! rate_limit:
//!   default: { capacity: 20, refill_rate: 5.0, max_queue_depth: 32 }
//!   overrides:
//!     - { tenant: acme, model: openai/gpt-4o, capacity: 100, refill_rate: 50.0, max_queue_depth: 128 }
//! circuit_breaker:
//!   default: { failure_threshold: 5, success_threshold: 1, open_timeout_ms: 30000, half_open_max_calls: 1 }
//! batch:
//!   enabled: true
//!   max_wait_ms: 20
//!   max_members: 16
//! ```
//!
//! Environment overrides (applied by [`GatewayConfig::apply_env`]):
//!
//! | Variable | Field |
//! |----------|-------|
//! | `AI_ADMISSION_BUCKET_CAPACITY` | `rate_limit.default.capacity` |
//! | `AI_ADMISSION_REFILL_PER_SEC` | `rate_limit.default.refill_rate` |
//! | `AI_ADMISSION_QUEUE_DEPTH` | `rate_limit.default.max_queue_depth` |
//! | `AI_ADMISSION_BREAKER_FAILURE_THRESHOLD` | `circuit_breaker.default.failure_threshold` |
//! | `AI_ADMISSION_BREAKER_OPEN_MS` | `circuit_breaker.default.open_timeout_ms` |
//! | `AI_ADMISSION_CACHE_TTL_MS` | `cache.default_ttl_ms` |
//! | `AI_ADMISSION_BATCH_MAX_WAIT_MS` | `batch.max_wait_ms` |

use crate::batch::BatchConfig;
use crate::cache::CacheConfig;
use crate::health::HealthConfig;
use crate::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerSettings};
use crate::resilience::rate_limiter::{BucketConfig, RateLimitConfig};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Serde adapter storing a `Duration` as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub batch: BatchConfig,
    pub health: HealthConfig,
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_circuit_breaker(mut self, settings: CircuitBreakerSettings) -> Self {
        self.circuit_breaker = settings;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let cfg: GatewayConfig = serde_yaml::from_str(yaml).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid gateway config: {}", e),
                ErrorContext::new().with_source("yaml"),
            )
        })?;
        Ok(cfg)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read config file: {}", e),
                ErrorContext::new().with_source(path.display().to_string()),
            )
        })?;
        Self::from_yaml_str(&text)
    }

    /// Applies `AI_ADMISSION_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides read through `lookup`. Unparseable values are errors.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name);
        if let Some(v) = parse_env::<u32>(&get, "AI_ADMISSION_BUCKET_CAPACITY")? {
            self.rate_limit.default.capacity = v;
        }
        if let Some(v) = parse_env::<f64>(&get, "AI_ADMISSION_REFILL_PER_SEC")? {
            self.rate_limit.default.refill_rate = v;
        }
        if let Some(v) = parse_env::<usize>(&get, "AI_ADMISSION_QUEUE_DEPTH")? {
            self.rate_limit.default.max_queue_depth = v;
        }
        if let Some(v) = parse_env::<u32>(&get, "AI_ADMISSION_BREAKER_FAILURE_THRESHOLD")? {
            self.circuit_breaker.default.failure_threshold = v;
        }
        if let Some(v) = parse_env::<u64>(&get, "AI_ADMISSION_BREAKER_OPEN_MS")? {
            self.circuit_breaker.default.open_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<u64>(&get, "AI_ADMISSION_CACHE_TTL_MS")? {
            self.cache.default_ttl = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<u64>(&get, "AI_ADMISSION_BATCH_MAX_WAIT_MS")? {
            self.batch.max_wait = Duration::from_millis(v);
        }
        Ok(self)
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        validate_bucket("rate_limit.default", &self.rate_limit.default)?;
        for (i, o) in self.rate_limit.overrides.iter().enumerate() {
            let path = format!("rate_limit.overrides[{}]", i);
            if o.tenant.is_empty() {
                return Err(invalid(format!("{}.tenant", path), "tenant must not be empty"));
            }
            validate_bucket(&path, &o.bucket)?;
        }

        validate_breaker("circuit_breaker.default", &self.circuit_breaker.default)?;
        for (i, o) in self.circuit_breaker.overrides.iter().enumerate() {
            validate_breaker(&format!("circuit_breaker.overrides[{}]", i), &o.breaker)?;
        }

        if self.cache.enabled {
            if self.cache.max_entries == 0 {
                return Err(invalid("cache.max_entries", "must be greater than 0"));
            }
            if self.cache.max_bytes == 0 {
                return Err(invalid("cache.max_bytes", "must be greater than 0"));
            }
        }
        if self.batch.enabled && self.batch.max_members == 0 {
            return Err(invalid("batch.max_members", "must be greater than 0"));
        }
        if self.health.max_samples == 0 {
            return Err(invalid("health.max_samples", "must be greater than 0"));
        }
        if self.health.window.is_zero() {
            return Err(invalid("health.window_ms", "must be greater than 0"));
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(get: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    match get(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            Error::configuration_with_context(
                format!("cannot parse {}", name),
                ErrorContext::new()
                    .with_field_path(name)
                    .with_details(format!("got {:?}", raw))
                    .with_source("env"),
            )
        }),
    }
}

fn invalid(path: impl Into<String>, msg: &str) -> Error {
    Error::configuration_with_context(msg, ErrorContext::new().with_field_path(path))
}

fn validate_bucket(path: &str, b: &BucketConfig) -> Result<()> {
    if b.capacity == 0 {
        return Err(invalid(format!("{}.capacity", path), "must be greater than 0"));
    }
    if !b.refill_rate.is_finite() || b.refill_rate < 0.0 {
        return Err(invalid(
            format!("{}.refill_rate", path),
            "must be a finite, non-negative number",
        ));
    }
    Ok(())
}

fn validate_breaker(path: &str, b: &CircuitBreakerConfig) -> Result<()> {
    if b.failure_threshold == 0 {
        return Err(invalid(format!("{}.failure_threshold", path), "must be greater than 0"));
    }
    if b.success_threshold == 0 {
        return Err(invalid(format!("{}.success_threshold", path), "must be greater than 0"));
    }
    if b.half_open_max_calls == 0 {
        return Err(invalid(format!("{}.half_open_max_calls", path), "must be greater than 0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn field_path(err: &Error) -> Option<String> {
        err.context().and_then(|c| c.field_path.clone())
    }

    #[test]
    fn test_default_config_is_valid() {
        GatewayConfig::default().validate().unwrap();
    }

    #[test]
    fn test_from_yaml_with_overrides() {
        let yaml = r#"
cache:
  default_ttl_ms: 1500
rate_limit:
  default: { capacity: 5, refill_rate: 1.0, max_queue_depth: 2 }
  overrides:
    - { tenant: acme, model: openai/gpt-4o, capacity: 50, refill_rate: 10.0, max_queue_depth: 8 }
circuit_breaker:
  default: { failure_threshold: 3, open_timeout_ms: 2000 }
  overrides:
    - { provider: flaky, failure_threshold: 1 }
batch:
  enabled: true
  max_wait_ms: 15
  max_members: 4
"#;
        let cfg = GatewayConfig::from_yaml_str(yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.cache.default_ttl, Duration::from_millis(1500));
        assert_eq!(cfg.rate_limit.default.capacity, 5);
        assert_eq!(cfg.rate_limit.bucket_for("acme", "openai/gpt-4o").capacity, 50);
        assert_eq!(cfg.rate_limit.bucket_for("acme", "other").capacity, 5);
        assert_eq!(cfg.circuit_breaker.default.open_timeout, Duration::from_secs(2));
        // unspecified fields keep defaults
        assert_eq!(cfg.circuit_breaker.default.success_threshold, 1);
        assert_eq!(cfg.circuit_breaker.config_for("flaky").failure_threshold, 1);
        assert_eq!(cfg.batch.max_wait, Duration::from_millis(15));
        assert_eq!(cfg.batch.max_members, 4);
    }

    #[test]
    fn test_yaml_roundtrip_keeps_ms_fields() {
        let cfg = GatewayConfig::default();
        let text = serde_yaml::to_string(&cfg).unwrap();
        assert!(text.contains("default_ttl_ms"));
        assert!(text.contains("open_timeout_ms"));
        assert_eq!(GatewayConfig::from_yaml_str(&text).unwrap(), cfg);
    }

    #[test]
    fn test_bad_yaml_is_configuration_error() {
        let err = GatewayConfig::from_yaml_str("rate_limit: [1, 2").unwrap_err();
        assert_eq!(err.code(), "configuration");
    }

    #[test]
    fn test_missing_file() {
        let err = GatewayConfig::from_yaml_file("/nonexistent/admission.yaml").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("AI_ADMISSION_BUCKET_CAPACITY", "7"),
            ("AI_ADMISSION_REFILL_PER_SEC", "2.5"),
            ("AI_ADMISSION_QUEUE_DEPTH", "3"),
            ("AI_ADMISSION_BREAKER_FAILURE_THRESHOLD", "9"),
            ("AI_ADMISSION_BREAKER_OPEN_MS", "1234"),
            ("AI_ADMISSION_CACHE_TTL_MS", "60000"),
            ("AI_ADMISSION_BATCH_MAX_WAIT_MS", "40"),
        ]
        .into_iter()
        .collect();
        let cfg = GatewayConfig::default()
            .apply_env_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.rate_limit.default.capacity, 7);
        assert_eq!(cfg.rate_limit.default.refill_rate, 2.5);
        assert_eq!(cfg.rate_limit.default.max_queue_depth, 3);
        assert_eq!(cfg.circuit_breaker.default.failure_threshold, 9);
        assert_eq!(cfg.circuit_breaker.default.open_timeout, Duration::from_millis(1234));
        assert_eq!(cfg.cache.default_ttl, Duration::from_secs(60));
        assert_eq!(cfg.batch.max_wait, Duration::from_millis(40));
    }

    #[test]
    fn test_unparseable_env_value() {
        let err = GatewayConfig::default()
            .apply_env_from(|k| (k == "AI_ADMISSION_QUEUE_DEPTH").then(|| "lots".to_string()))
            .unwrap_err();
        assert_eq!(field_path(&err).as_deref(), Some("AI_ADMISSION_QUEUE_DEPTH"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let cfg = GatewayConfig::default()
            .with_rate_limit(RateLimitConfig::default().with_default(BucketConfig::default().with_capacity(0)));
        let err = cfg.validate().unwrap_err();
        assert_eq!(field_path(&err).as_deref(), Some("rate_limit.default.capacity"));
    }

    #[test]
    fn test_validate_rejects_nan_refill_in_override() {
        let cfg = GatewayConfig::default().with_rate_limit(RateLimitConfig::default().with_override(
            "t1",
            None,
            BucketConfig::default().with_refill_rate(f64::NAN),
        ));
        let err = cfg.validate().unwrap_err();
        assert_eq!(field_path(&err).as_deref(), Some("rate_limit.overrides[0].refill_rate"));
    }

    #[test]
    fn test_validate_rejects_zero_breaker_threshold() {
        let cfg = GatewayConfig::default().with_circuit_breaker(CircuitBreakerSettings::new(
            CircuitBreakerConfig::new().with_failure_threshold(0),
        ));
        let err = cfg.validate().unwrap_err();
        assert_eq!(
            field_path(&err).as_deref(),
            Some("circuit_breaker.default.failure_threshold")
        );
    }
}
