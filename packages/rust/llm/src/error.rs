//! Errors raised by text-generation backends.

use std::time::Duration;

use designlens_shared::DesignLensError;
use thiserror::Error;

/// Errors that can occur when calling a chat-completions endpoint.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Remote rate limit (HTTP 429).
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Permanent client-side error; retrying will not help.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Non-success response from the provider.
    #[error("provider error: {message}")]
    Provider {
        status: Option<u16>,
        message: String,
        retryable: bool,
    },

    /// Success status, but the body could not be understood.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// HTTP/network error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error (missing API key, bad header, etc.).
    #[error("configuration error: {0}")]
    Config(String),
}

impl LlmError {
    pub fn provider(status: Option<u16>, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            status,
            message: message.into(),
            retryable,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::InvalidRequest(_) | Self::Malformed(_) | Self::Config(_) => false,
        }
    }

    /// Get a short error code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Provider { .. } => "provider_error",
            Self::Malformed(_) => "malformed_response",
            Self::Http(e) if e.is_timeout() => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }
}

impl From<LlmError> for DesignLensError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Config(message) => DesignLensError::config(message),
            other => DesignLensError::Upstream(format!("[{}] {other}", other.code())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_error_class() {
        assert!(
            LlmError::RateLimited {
                retry_after: Duration::from_secs(1)
            }
            .is_retryable()
        );
        assert!(LlmError::provider(Some(503), "overloaded", true).is_retryable());
        assert!(!LlmError::provider(Some(400), "bad", false).is_retryable());
        assert!(!LlmError::InvalidRequest("too large".into()).is_retryable());
        assert!(!LlmError::Malformed("no choices".into()).is_retryable());
    }

    #[test]
    fn converts_to_upstream_error() {
        let err: DesignLensError = LlmError::provider(Some(502), "bad gateway", true).into();
        assert!(matches!(err, DesignLensError::Upstream(_)));
        assert!(err.to_string().contains("provider_error"));

        let err: DesignLensError = LlmError::config("no key").into();
        assert!(matches!(err, DesignLensError::Config { .. }));
    }
}
