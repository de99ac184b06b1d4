//! Error types for ShardIO
//!
//! This module defines the common error types used throughout the system.

use std::fmt;
use thiserror::Error;

/// Common result type for ShardIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a suspended wait was unwound before it completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    /// The placement group started a new interval (peering reset)
    IntervalChanged { epoch: u32 },
    /// The placement group is being removed or stopped
    PgStopping,
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IntervalChanged { epoch } => write!(f, "interval changed at epoch {epoch}"),
            Self::PgStopping => write!(f, "pg stopping"),
        }
    }
}

/// Common error type for ShardIO
#[derive(Debug, Error)]
pub enum Error {
    // Object errors
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("object corrupted: {0}")]
    ObjectCorrupted(String),

    // Lifecycle errors
    #[error("system shutdown")]
    SystemShutdown,

    #[error("operation interrupted: {0}")]
    Interrupted(InterruptReason),

    // Backend errors
    #[error("backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Request errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an object-not-found error
    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::ObjectNotFound(what.to_string())
    }

    /// Create an object-corrupted error
    pub fn corrupted(what: impl fmt::Display) -> Self {
        Self::ObjectCorrupted(what.to_string())
    }

    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if the outer operation layer may retry after this error.
    ///
    /// Interruptions are retryable once the placement group settles;
    /// shutdown and data errors are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Interrupted(_) | Self::Io(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound(_))
    }

    /// Check if this error was raised because the shard is going away
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::SystemShutdown)
    }

    /// Negative POSIX error code reported back to clients
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::ObjectNotFound(_) => -2,              // ENOENT
            Self::Interrupted(_) => -4,                 // EINTR
            Self::ObjectCorrupted(_) | Self::Io(_) => -5, // EIO
            Self::InvalidArgument(_) | Self::Configuration(_) => -22, // EINVAL
            Self::SystemShutdown => -108,               // ESHUTDOWN
            Self::Backend(_) | Self::Internal(_) => -5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Interrupted(InterruptReason::PgStopping).is_retryable());
        assert!(!Error::SystemShutdown.is_retryable());
        assert!(!Error::corrupted("obj").is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::not_found("1:0::foo:head").is_not_found());
        assert!(!Error::SystemShutdown.is_not_found());
        assert!(Error::SystemShutdown.is_shutdown());
    }

    #[test]
    fn test_error_errno() {
        assert_eq!(Error::not_found("x").errno(), -2);
        assert_eq!(Error::corrupted("x").errno(), -5);
        assert_eq!(Error::SystemShutdown.errno(), -108);
        assert_eq!(
            Error::Interrupted(InterruptReason::IntervalChanged { epoch: 7 }).errno(),
            -4
        );
    }

    #[test]
    fn test_interrupt_display() {
        let err = Error::Interrupted(InterruptReason::IntervalChanged { epoch: 12 });
        assert_eq!(err.to_string(), "operation interrupted: interval changed at epoch 12");
    }
}
