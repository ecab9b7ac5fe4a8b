//! Error types for the cache engine
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache engine.
///
/// Every variant is a caller-input error raised synchronously by the
/// offending call. Panics raised by removal/update callbacks and change
/// monitors are absorbed by the cache and never surface here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// An argument passed to an insert or trim operation was rejected
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A configuration value was malformed or out of range
    #[error("Invalid configuration value for '{key}': {reason}")]
    InvalidConfiguration { key: String, reason: String },

    /// A cache with the same name is already alive in this process
    #[error("A cache named '{0}' already exists")]
    DuplicateName(String),
}

impl CacheError {
    /// Returns true for errors caused by a bad argument or configuration value.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            CacheError::InvalidArgument(_) | CacheError::InvalidConfiguration { .. }
        )
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache engine.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CacheError::InvalidConfiguration {
            key: "pollingInterval".to_string(),
            reason: "must not be zero".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid configuration value for 'pollingInterval': must not be zero"
        );
        assert!(err.is_invalid_argument());
        assert!(!CacheError::DuplicateName("x".to_string()).is_invalid_argument());
    }
}
