//! Error types for the Ragline query-serving core.
//!
//! Uses `thiserror` for public API error types. [`RagError`] is `Clone` so a
//! single failure can be handed to every caller coalesced on one cache key.

use std::path::PathBuf;

/// Top-level error type for the query-serving pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RagError {
    #[error("Upstream '{service}' unavailable: {message}")]
    UpstreamUnavailable { service: String, message: String },

    #[error("Connection pool for '{service}' exhausted after waiting {waited_ms}ms")]
    PoolExhausted { service: String, waited_ms: u64 },

    #[error("Cache computation for key '{key}' failed: {source}")]
    CacheComputeFailed { key: String, source: Box<RagError> },

    #[error("Malformed input: {reason}")]
    MalformedInput { reason: String },

    #[error("Upstream '{service}' returned an invalid response: {message}")]
    InvalidResponse { service: String, message: String },

    #[error("Vector storage error: {message}")]
    Storage { message: String },

    #[error("Deadline of {timeout_ms}ms exceeded")]
    DeadlineExceeded { timeout_ms: u64 },

    #[error("Computation was abandoned before completing")]
    Cancelled,
}

impl RagError {
    pub fn upstream(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn invalid_response(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedInput {
            reason: reason.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Whether the pool layer may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self.root_cause(), RagError::UpstreamUnavailable { .. })
    }

    /// Whether a caller may retry later (with backoff) and expect success.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.root_cause(),
            RagError::UpstreamUnavailable { .. }
                | RagError::PoolExhausted { .. }
                | RagError::DeadlineExceeded { .. }
                | RagError::Cancelled
        )
    }

    /// Strip `CacheComputeFailed` wrappers down to the originating error.
    pub fn root_cause(&self) -> &RagError {
        let mut current = self;
        while let RagError::CacheComputeFailed { source, .. } = current {
            current = source;
        }
        current
    }
}

impl From<rusqlite::Error> for RagError {
    fn from(err: rusqlite::Error) -> Self {
        RagError::storage(err.to_string())
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] Box<figment::Error>),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// A type alias for results using [`RagError`].
pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_upstream() {
        let err = RagError::upstream("llm", "connection refused");
        assert_eq!(
            err.to_string(),
            "Upstream 'llm' unavailable: connection refused"
        );
    }

    #[test]
    fn test_error_display_pool_exhausted() {
        let err = RagError::PoolExhausted {
            service: "embedder".into(),
            waited_ms: 250,
        };
        assert_eq!(
            err.to_string(),
            "Connection pool for 'embedder' exhausted after waiting 250ms"
        );
    }

    #[test]
    fn test_root_cause_unwraps_nested_cache_failures() {
        let inner = RagError::upstream("vector_store", "timeout");
        let wrapped = RagError::CacheComputeFailed {
            key: "answer:abc".into(),
            source: Box::new(RagError::CacheComputeFailed {
                key: "retrieval:def".into(),
                source: Box::new(inner),
            }),
        };
        assert!(matches!(
            wrapped.root_cause(),
            RagError::UpstreamUnavailable { service, .. } if service == "vector_store"
        ));
        assert!(wrapped.is_retryable());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RagError::upstream("llm", "503").is_retryable());
        assert!(!RagError::invalid_response("llm", "bad json").is_retryable());
        assert!(!RagError::malformed("empty").is_retryable());
        assert!(
            !RagError::PoolExhausted {
                service: "llm".into(),
                waited_ms: 10
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(
            RagError::PoolExhausted {
                service: "llm".into(),
                waited_ms: 10
            }
            .is_transient()
        );
        assert!(RagError::Cancelled.is_transient());
        assert!(!RagError::malformed("empty question").is_transient());
        assert!(!RagError::storage("disk full").is_transient());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("min_connections exceeds max_connections");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: min_connections exceeds max_connections"
        );
    }
}
