//! 错误分类：将原始厂商失败映射为类型化结果。
//!
//! # Error Classification
//!
//! Maps a [`RawError`] from the provider adapter to an [`ErrorClass`], and the
//! class to the caller-facing [`Error`].
//!
//! Provider error codes take precedence over HTTP status, which takes precedence
//! over transport failures.
//!
//! | Class | Typical input | Breaker | Surfaces as |
//! |-------|---------------|---------|-------------|
//! | `Retryable` | connect reset, 408, 409, 504 | failure | `ProviderUnavailable` / `InternalTimeout` |
//! | `RateLimited` | 429, `rate_limit_exceeded`, `insufficient_quota` | neutral | `ProviderRateLimited` |
//! | `AuthFailure` | 401, 403, `invalid_api_key` | neutral | `AuthFailure` |
//! | `ProviderUnavailable` | 500, 502, 503, 529, `overloaded_error` | failure | `ProviderUnavailable` |
//! | `MalformedRequest` | 400, 404, 413, 422, `context_length_exceeded` | neutral | `MalformedRequest` |
//!
//! ```rust
//! use ai_lib_admission::classify::{ErrorClass, ErrorClassifier};
//! use ai_lib_admission::provider::RawError;
//!
//! let class = ErrorClassifier::classify(&RawError::http(529, "overloaded"));
//! assert_eq!(class, ErrorClass::ProviderUnavailable);
//! assert!(class.counts_against_provider());
//! ```

use crate::error::PROVIDER_CALL_STAGE;
use crate::provider::{RawError, TransportFailure};
use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient network or timeout failure.
    Retryable,
    /// Provider-side throttling.
    RateLimited,
    AuthFailure,
    /// Provider is down or overloaded.
    ProviderUnavailable,
    /// Caller error; fails on any provider.
    MalformedRequest,
}

impl ErrorClass {
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::RateLimited => "rate_limited",
            Self::AuthFailure => "auth_failure",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::MalformedRequest => "malformed_request",
        }
    }

    /// Whether a caller's retry policy may retry this class.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Retryable | Self::RateLimited | Self::ProviderUnavailable
        )
    }

    /// Counts as a circuit breaker failure.
    #[inline]
    pub fn counts_against_provider(&self) -> bool {
        matches!(self, Self::Retryable | Self::ProviderUnavailable)
    }

    /// Caller-side problem, kept out of provider success rates.
    #[inline]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::AuthFailure | Self::MalformedRequest)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stateless mapping from raw provider failures to [`ErrorClass`].
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(raw: &RawError) -> ErrorClass {
        if let Some(class) = raw.code.as_deref().and_then(Self::from_provider_code) {
            return class;
        }
        if let Some(status) = raw.status {
            return Self::from_http_status(status);
        }
        match raw.transport {
            Some(_) => ErrorClass::Retryable,
            // Nothing to go on; treat as an outage rather than hide it.
            None => ErrorClass::ProviderUnavailable,
        }
    }

    /// Provider error code/type aliases (`invalid_api_key`, `overloaded_error`, ...).
    pub fn from_provider_code(code: &str) -> Option<ErrorClass> {
        let class = match code {
            "invalid_request" | "invalid_request_error" | "not_found" | "model_not_found"
            | "request_too_large" | "context_length_exceeded" => ErrorClass::MalformedRequest,
            "authentication" | "authentication_error" | "authorized_error" | "invalid_api_key"
            | "permission_denied" | "permission_error" => ErrorClass::AuthFailure,
            "rate_limited" | "rate_limit_exceeded" | "quota_exhausted" | "insufficient_quota" => {
                ErrorClass::RateLimited
            }
            "server_error" | "api_error" | "overloaded" | "overloaded_error" => {
                ErrorClass::ProviderUnavailable
            }
            "timeout" | "conflict" => ErrorClass::Retryable,
            _ => return None,
        };
        Some(class)
    }

    pub fn from_http_status(status: u16) -> ErrorClass {
        match status {
            401 | 403 => ErrorClass::AuthFailure,
            408 | 409 | 504 => ErrorClass::Retryable,
            429 => ErrorClass::RateLimited,
            400..=499 => ErrorClass::MalformedRequest,
            _ => ErrorClass::ProviderUnavailable,
        }
    }

    /// Whether `raw` describes a timeout rather than another transient fault.
    pub fn is_timeout(raw: &RawError) -> bool {
        raw.transport == Some(TransportFailure::Timeout)
            || matches!(raw.status, Some(408) | Some(504))
            || raw.code.as_deref() == Some("timeout")
    }

    /// Caller-facing error for a classified failure.
    pub fn into_error(provider: &str, class: ErrorClass, raw: &RawError) -> Error {
        let message = raw.to_string();
        match class {
            ErrorClass::Retryable if Self::is_timeout(raw) => Error::timeout(PROVIDER_CALL_STAGE),
            ErrorClass::Retryable | ErrorClass::ProviderUnavailable => Error::ProviderUnavailable {
                provider: provider.to_string(),
                message,
            },
            ErrorClass::RateLimited => Error::ProviderRateLimited {
                provider: provider.to_string(),
                message,
                retry_after_ms: raw.retry_after_ms,
            },
            ErrorClass::AuthFailure => Error::AuthFailure {
                provider: provider.to_string(),
                message,
            },
            ErrorClass::MalformedRequest => Error::MalformedRequest { message },
        }
    }
}
