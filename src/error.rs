//! Error types for throttling operations.
//!
//! The error hierarchy separates counter-store failures (which the engine
//! treats as fail-open) from configuration failures (which poison or reject
//! a config load) and from the `TooManyRequests` propagation signal, which
//! is control flow rather than a fault.

use thiserror::Error;

/// Result type for throttling operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;

/// Main error type for throttling operations.
#[derive(Debug, Error)]
pub enum ThrottleError {
    /// Counter store backend error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Counter-store errors.
///
/// A store that cannot answer is never allowed to block traffic: the engine
/// logs the failure and treats the affected rule as not exceeded.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not serve the request.
    #[error("{message}")]
    Unavailable {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Connection pool exhausted.
    #[error("Connection pool exhausted")]
    PoolExhausted,
}

impl StoreError {
    /// Create a new unavailable error.
    pub fn unavailable(message: impl Into<String>, retryable: bool) -> Self {
        Self::Unavailable {
            message: message.into(),
            retryable,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable { retryable, .. } => *retryable,
            Self::PoolExhausted => true,
            _ => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid rule configuration.
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// Invalid URI pattern.
    #[error("Invalid URI pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Missing required configuration.
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    /// A settings document failed to parse.
    #[error("Invalid settings document: {0}")]
    InvalidDocument(String),

    /// The configuration producer failed.
    #[error("Configuration producer failed: {0}")]
    LoadFailed(String),
}

/// Egress-to-ingress propagation signal.
///
/// Raised by the egress side when an outbound call was throttled (locally or
/// by the remote returning 429) and `propagate_to_ingress` is enabled. The
/// ingress middleware catches it and answers 429 with the carried
/// `Retry-After` value instead of surfacing the error.
///
/// The signal is found by walking an error's `source()` chain, so it survives
/// wrapping inside aggregate errors as long as wrappers preserve the chain.
#[derive(Debug, Clone, Error)]
#[error("too many requests, retry after {retry_after}")]
pub struct TooManyRequests {
    /// The `Retry-After` value: relative seconds or an absolute unix
    /// timestamp, as produced by the rejecting side.
    pub retry_after: String,
}

impl TooManyRequests {
    /// Create a new propagation signal.
    pub fn new(retry_after: impl Into<String>) -> Self {
        Self {
            retry_after: retry_after.into(),
        }
    }

    /// Scan an error and its source chain for a propagation signal.
    ///
    /// Flattens arbitrarily deep wrappers; returns the first signal found.
    pub fn find<'a>(error: &'a (dyn std::error::Error + 'static)) -> Option<&'a TooManyRequests> {
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
        while let Some(err) = current {
            if let Some(signal) = err.downcast_ref::<TooManyRequests>() {
                return Some(signal);
            }
            current = err.source();
        }
        None
    }
}
