//! Canonical request keys and key patterns.

use crate::types::{Payload, RequestParams};
use crate::{Error, ErrorContext, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Canonical identity of a logical request, shared by the cache and the deduplicator.
///
/// Rendered as `<tenant>:<model>:<sha256-hex>` so tenant- and model-scoped
/// invalidation works on any backend that can match key strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    key: String,
    pub tenant: String,
    pub model: String,
    pub fingerprint: String,
}

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// Computes canonical keys. Pure and deterministic.
#[derive(Debug, Clone, Default)]
pub struct RequestKeyer {
    salt: Option<String>,
}

impl RequestKeyer {
    pub fn new() -> Self {
        Self { salt: None }
    }

    /// Salt mixed into every fingerprint; changing it orphans all existing entries.
    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn canonicalize(
        &self,
        tenant: &str,
        model: &str,
        payload: &Payload,
        params: &RequestParams,
    ) -> CacheKey {
        let mut doc = String::with_capacity(256);
        doc.push_str("{\"model\":");
        write_canonical(&Value::from(model), &mut doc);
        doc.push_str(",\"params\":{");
        for (i, (k, v)) in params.semantic().enumerate() {
            if i > 0 {
                doc.push(',');
            }
            write_canonical(&Value::from(k.as_str()), &mut doc);
            doc.push(':');
            write_canonical(v, &mut doc);
        }
        doc.push_str("},\"payload\":");
        write_canonical(payload, &mut doc);
        if let Some(ref s) = self.salt {
            doc.push_str(",\"salt\":");
            write_canonical(&Value::from(s.as_str()), &mut doc);
        }
        doc.push_str(",\"tenant\":");
        write_canonical(&Value::from(tenant), &mut doc);
        doc.push('}');

        let mut hasher = Sha256::new();
        hasher.update(doc.as_bytes());
        let fingerprint: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();

        CacheKey {
            key: format!(
                "{}:{}:{}",
                escape_component(tenant),
                escape_component(model),
                fingerprint
            ),
            tenant: tenant.to_string(),
            model: model.to_string(),
            fingerprint,
        }
    }
}

/// `*` is escaped too so that a component never acts as a wildcard in a [`KeyPattern`].
fn escape_component(s: &str) -> String {
    s.replace('%', "%25")
        .replace(':', "%3A")
        .replace('*', "%2A")
}

/// Writes `v` with sorted object keys and integral floats collapsed to integers.
fn write_canonical(v: &Value, out: &mut String) {
    match v {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    out.push_str(&(f as i64).to_string());
                } else {
                    out.push_str(&f.to_string());
                }
            }
        }
        Value::String(s) => out.push_str(&serde_json::to_string(s).unwrap_or_default()),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).unwrap_or_default());
                out.push(':');
                write_canonical(&map[k], out);
            }
            out.push('}');
        }
    }
}

/// Glob-style pattern over canonical key strings; `*` matches any run of characters.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let raw = pattern.into();
        let body = regex::escape(&raw).replace("\\*", ".*");
        let regex = Regex::new(&format!("^{}$", body)).map_err(|e| {
            Error::validation_with_context(
                format!("invalid key pattern: {}", e),
                ErrorContext::new()
                    .with_details(raw.clone())
                    .with_source("cache"),
            )
        })?;
        Ok(Self { raw, regex })
    }

    /// Every entry belonging to `tenant`.
    pub fn tenant(tenant: &str) -> Result<Self> {
        Self::new(format!("{}:*", escape_component(tenant)))
    }

    /// Every entry for `model` under `tenant`.
    pub fn model(tenant: &str, model: &str) -> Result<Self> {
        Self::new(format!(
            "{}:{}:*",
            escape_component(tenant),
            escape_component(model)
        ))
    }

    pub fn prefix(prefix: &str) -> Result<Self> {
        Self::new(format!("{}*", prefix))
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(payload: Value, params: RequestParams) -> CacheKey {
        RequestKeyer::new().canonicalize("t1", "openai/gpt-4o", &payload, &params)
    }

    #[test]
    fn test_key_ignores_object_key_order() {
        let a = key(
            json!({"messages": [{"role": "user", "content": "hi"}], "n": 1}),
            RequestParams::new(),
        );
        let b: Value =
            serde_json::from_str(r#"{ "n": 1, "messages": [ {"content":"hi","role":"user"} ] }"#)
                .unwrap();
        assert_eq!(a, key(b, RequestParams::new()));
    }

    #[test]
    fn test_key_normalizes_integral_floats() {
        let a = key(json!({}), RequestParams::new().with("max_tokens", 16));
        let b = key(json!({}), RequestParams::new().with("max_tokens", 16.0));
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_ignores_control_params() {
        let a = key(json!({"p": 1}), RequestParams::new().with("temperature", 0));
        let b = key(
            json!({"p": 1}),
            RequestParams::new()
                .with("temperature", 0)
                .with("batchable", true)
                .with("request_id", "abc"),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_separates_tenants_and_params() {
        let keyer = RequestKeyer::new();
        let p = json!({"prompt": "x"});
        let a = keyer.canonicalize("t1", "m", &p, &RequestParams::new());
        let b = keyer.canonicalize("t2", "m", &p, &RequestParams::new());
        let c = keyer.canonicalize("t1", "m", &p, &RequestParams::new().with("top_p", 0.5));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_salt_changes_fingerprint() {
        let p = json!("x");
        let plain = RequestKeyer::new().canonicalize("t", "m", &p, &RequestParams::new());
        let salted = RequestKeyer::new()
            .with_salt("v2")
            .canonicalize("t", "m", &p, &RequestParams::new());
        assert_ne!(plain, salted);
    }

    #[test]
    fn test_key_layout_escapes_separators() {
        let k = RequestKeyer::new().canonicalize("acme:eu", "m", &json!(1), &RequestParams::new());
        assert!(k.as_str().starts_with("acme%3Aeu:m:"));
        assert_eq!(k.fingerprint.len(), 64);
    }

    #[test]
    fn test_tenant_with_star_stays_literal() {
        let keyer = RequestKeyer::new();
        let acme = keyer.canonicalize("acme", "m", &json!(1), &RequestParams::new());
        let starred = keyer.canonicalize("a*", "m", &json!(1), &RequestParams::new());
        assert!(starred.as_str().starts_with("a%2A:m:"));
        assert!(!KeyPattern::tenant("a*").unwrap().matches(acme.as_str()));
        assert!(!KeyPattern::tenant("*").unwrap().matches(acme.as_str()));
        assert!(KeyPattern::tenant("a*").unwrap().matches(starred.as_str()));
        assert!(!KeyPattern::model("acme", "*").unwrap().matches(acme.as_str()));
    }

    #[test]
    fn test_patterns() {
        let keyer = RequestKeyer::new();
        let k = keyer.canonicalize("t1", "openai/gpt-4o", &json!(1), &RequestParams::new());
        assert!(KeyPattern::tenant("t1").unwrap().matches(k.as_str()));
        assert!(!KeyPattern::tenant("t").unwrap().matches(k.as_str()));
        assert!(KeyPattern::model("t1", "openai/gpt-4o")
            .unwrap()
            .matches(k.as_str()));
        assert!(!KeyPattern::model("t1", "openai/gpt-4")
            .unwrap()
            .matches(k.as_str()));
        assert!(KeyPattern::new("*").unwrap().matches(k.as_str()));
        assert!(KeyPattern::prefix("t1:openai")
            .unwrap()
            .matches(k.as_str()));
        // regex metacharacters in patterns are literal
        assert!(!KeyPattern::new("t1.openai*").unwrap().matches(k.as_str()));
    }
}
