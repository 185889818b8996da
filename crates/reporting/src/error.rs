//! `TallyIO` Reporting Error System
//!
//! Error taxonomy for registration, write fan-out, store access and queries.
//! Absent aggregates are never errors; they surface as `Ok(None)`.

use std::time::Duration;
use thiserror::Error;

/// Reporting result type for all operations
pub type ReportingResult<T> = Result<T, ReportingError>;

/// Main error type for reporting operations
#[derive(Error, Debug)]
pub enum ReportingError {
    /// Configuration errors (duplicate or unknown names, unsupported granularity)
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Validation errors
    #[error("Validation failed for field '{field}': {reason}")]
    Validation {
        /// Field that failed validation
        field: String,
        /// Reason for validation failure
        reason: String,
    },

    /// Invalid query chain
    #[error("Invalid query: {reason}")]
    Query {
        /// Reason the query cannot be resolved
        reason: String,
    },

    /// Store operation errors
    #[error("Store operation failed: {operation} - {reason}")]
    Store {
        /// Operation that failed
        operation: String,
        /// Reason for failure
        reason: String,
        /// Whether the operation may succeed when retried
        transient: bool,
    },

    /// A cell transaction exhausted the store retry budget
    #[error("Transaction on '{path}' aborted after {attempts} attempts: {source}")]
    TransactionAborted {
        /// Cell path
        path: String,
        /// Attempts made before giving up
        attempts: u32,
        /// Failure of the last attempt
        source: Box<ReportingError>,
    },

    /// At least one fan-out update of a save call failed
    #[error("{failed} of {total} cell updates failed, first failure: {first}")]
    PartialWrite {
        /// Number of failed cell updates
        failed: usize,
        /// Number of attempted cell updates
        total: usize,
        /// First observed failure
        first: Box<ReportingError>,
    },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}: {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Duration before timeout
        duration: Duration,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error (use sparingly)
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl ReportingError {
    /// Create configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create validation error
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create query error
    pub fn query(reason: impl Into<String>) -> Self {
        Self::Query {
            reason: reason.into(),
        }
    }

    /// Create store error for a failure that retrying cannot fix
    pub fn store(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            reason: reason.into(),
            transient: false,
        }
    }

    /// Create store error for a failure that may clear on retry
    pub fn store_transient(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            reason: reason.into(),
            transient: true,
        }
    }

    /// Create transaction aborted error
    pub fn transaction_aborted(path: impl Into<String>, attempts: u32, last: Self) -> Self {
        Self::TransactionAborted {
            path: path.into(),
            attempts,
            source: Box::new(last),
        }
    }

    /// Create timeout error
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create internal error (use sparingly)
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if error is a configuration or validation problem of the caller
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::Validation { .. } | Self::Query { .. }
        )
    }

    /// Check if error is retryable by the caller
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Configuration { .. } => false,
            Self::Validation { .. } => false,
            Self::Query { .. } => false,
            Self::Store { transient, .. } => *transient,
            Self::TransactionAborted { .. } => true,
            Self::PartialWrite { .. } => true,
            Self::Timeout { .. } => true,
            Self::Io(_) => true,
            Self::Internal { .. } => false,
        }
    }
}

impl From<config::ConfigError> for ReportingError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

impl From<toml::de::Error> for ReportingError {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration(err.to_string())
    }
}
