//! Error types for keylimit operations.

use thiserror::Error;

/// Main error type for keylimit operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// The rate limit key was missing, empty or not a scalar value
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A strict token bucket did not hold enough tokens for the request
    #[error("Insufficient capacity: requested {requested}, available {available}")]
    InsufficientCapacity {
        /// Tokens asked for by the caller
        requested: u64,
        /// Tokens held by the bucket at the time of the request
        available: i64,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No timer runtime was available to drive replenishment
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Whether this error is a throttling signal rather than a defect.
    pub fn is_throttled(&self) -> bool {
        matches!(self, LimiterError::InsufficientCapacity { .. })
    }
}

/// Result type alias for keylimit operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_capacity_message() {
        let err = LimiterError::InsufficientCapacity {
            requested: 3,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient capacity: requested 3, available 1"
        );
        assert!(err.is_throttled());
    }

    #[test]
    fn test_invalid_key_is_not_throttling() {
        let err = LimiterError::InvalidKey("key is required".to_string());
        assert!(!err.is_throttled());
        assert_eq!(err.to_string(), "Invalid key: key is required");
    }
}
