//! Error types for the resilience layer.

use std::time::Duration;

/// Resilience layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    /// Network error talking to the config service.
    #[error("network error: {message}")]
    Network { message: String },

    /// Authentication failed or token invalid.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Rate limit exceeded.
    #[error("rate limited: retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Response could not be decoded.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    /// Topology or config document is structurally incomplete.
    #[error("invalid document: {message}")]
    InvalidDocument { message: String },

    /// Checkpoint store error.
    #[error("checkpoint store error: {message}")]
    Checkpoint { message: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl ResilienceError {
    /// Whether the error is retryable within a single fetch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Network { .. })
    }

    pub(crate) fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ResilienceError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

/// Result type for resilience operations.
pub type ResilienceResult<T> = Result<T, ResilienceError>;
