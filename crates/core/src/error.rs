//! Error types for the backfill engine
//!
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Store and loader operations are total: they absorb failures and report
//! them through logs and listener callbacks. Errors only surface from
//! construction and configuration, and from the history provider boundary.

use std::io;
use thiserror::Error;

/// Result type alias for backfill operations
pub type BackfillResult<T> = std::result::Result<T, BackfillError>;

/// Error types for the backfill engine
#[derive(Debug, Error)]
pub enum BackfillError {
    /// No history provider could be reached
    #[error("History provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// A provider call failed
    #[error("History provider call '{operation}' failed: {message}")]
    Provider {
        /// Provider operation that failed
        operation: &'static str,
        /// Failure description
        message: String,
    },

    /// Configuration rejected at construction time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error (configuration files)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackfillError {
    /// Configuration error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        BackfillError::InvalidConfig(message.into())
    }

    /// Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        BackfillError::Internal(message.into())
    }
}

/// Failure reported by a history provider.
///
/// Providers have no retry contract of their own; every retry decision is
/// made by the loader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// No provider is reachable
    #[error("no history provider available: {0}")]
    Unavailable(String),

    /// The call reached the provider but failed
    #[error("{operation} failed: {message}")]
    Failed {
        /// Provider operation that failed
        operation: &'static str,
        /// Failure description
        message: String,
    },
}

impl ProviderError {
    /// Provider-unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        ProviderError::Unavailable(message.into())
    }

    /// Failed-call error
    pub fn failed(operation: &'static str, message: impl Into<String>) -> Self {
        ProviderError::Failed {
            operation,
            message: message.into(),
        }
    }

    /// True if no provider was reachable at all
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_))
    }
}

impl From<ProviderError> for BackfillError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Unavailable(message) => BackfillError::ProviderUnavailable(message),
            ProviderError::Failed { operation, message } => {
                BackfillError::Provider { operation, message }
            }
        }
    }
}
