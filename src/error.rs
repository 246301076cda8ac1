use thiserror::Error;

/// `InternalTimeout` stage for a deadline that expired while the provider was working.
pub const PROVIDER_CALL_STAGE: &str = "provider call";

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "rate_limit.default.capacity")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "circuit_breaker", "config")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the admission pipeline.
///
/// Backpressure signals (`QueueFull`, `RateLimitTimeout`, `CircuitOpen`) are kept
/// apart from provider outcomes so callers can shed load instead of retrying.
///
/// Every variant is `Clone + PartialEq`: followers of a deduplicated call receive
/// a value equal to the leader's error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Rate limit queue full for {tenant}/{model} (depth {depth})")]
    QueueFull {
        tenant: String,
        model: String,
        depth: usize,
    },

    #[error("Timed out after {waited_ms}ms waiting for a rate limit token for {tenant}/{model}")]
    RateLimitTimeout {
        tenant: String,
        model: String,
        waited_ms: u64,
    },

    #[error("Circuit open for provider {provider}")]
    CircuitOpen {
        provider: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Provider {provider} unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("Provider {provider} rate limited: {message}")]
    ProviderRateLimited {
        provider: String,
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Authentication failed for provider {provider}: {message}")]
    AuthFailure { provider: String, message: String },

    #[error("Malformed request: {message}")]
    MalformedRequest { message: String },

    #[error("Timed out during {stage}")]
    InternalTimeout { stage: String },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization {
            message: e.to_string(),
        }
    }
}

impl Error {
    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn timeout(stage: impl Into<String>) -> Self {
        Error::InternalTimeout {
            stage: stage.into(),
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Stable snake_case identifier, suitable for metrics attributes.
    pub fn code(&self) -> &'static str {
        match self {
            Error::QueueFull { .. } => "queue_full",
            Error::RateLimitTimeout { .. } => "rate_limit_timeout",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::ProviderUnavailable { .. } => "provider_unavailable",
            Error::ProviderRateLimited { .. } => "provider_rate_limited",
            Error::AuthFailure { .. } => "auth_failure",
            Error::MalformedRequest { .. } => "malformed_request",
            Error::InternalTimeout { .. } => "internal_timeout",
            Error::Configuration { .. } => "configuration",
            Error::Validation { .. } => "validation",
            Error::Runtime { .. } => "runtime",
            Error::Serialization { .. } => "serialization",
        }
    }

    /// Whether the caller's own retry policy may reasonably retry this error.
    ///
    /// The pipeline itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ProviderUnavailable { .. }
                | Error::ProviderRateLimited { .. }
                | Error::InternalTimeout { .. }
                | Error::RateLimitTimeout { .. }
                | Error::CircuitOpen { .. }
        )
    }

    /// Local backpressure produced by this pipeline, not by the provider.
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            Error::QueueFull { .. } | Error::RateLimitTimeout { .. } | Error::CircuitOpen { .. }
        )
    }

    /// Whether this outcome is a circuit breaker failure for the provider.
    ///
    /// Timeouts of local waits (batch window, dedup wait) say nothing about the provider.
    pub fn counts_against_provider(&self) -> bool {
        matches!(self, Error::ProviderUnavailable { .. }) || self.is_provider_timeout()
    }

    /// Timed out while the provider itself was handling the call.
    pub fn is_provider_timeout(&self) -> bool {
        matches!(self, Error::InternalTimeout { stage } if stage == PROVIDER_CALL_STAGE)
    }

    /// Provider- or breaker-suggested backoff, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Error::CircuitOpen { retry_after_ms, .. }
            | Error::ProviderRateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}
