//! Error types for Floodgate.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Invalid policy or service configuration, fatal at load time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network, timeout or protocol failure talking to the coordinator
    #[error("Coordinator error: {context}: {source}")]
    Coordinator {
        context: String,
        #[source]
        source: redis::RedisError,
    },

    /// A script reply did not match the `{allowed, count, remaining, reset_ms}` schema
    #[error("Script error: {0}")]
    Script(String),

    /// Bad key or policy supplied at call time
    #[error("Validation error: {0}")]
    Validation(String),

    /// Too many in-flight probes while the coordinator circuit is half-open
    #[error("Concurrency limit exceeded: {in_flight} in-flight probes (max {max})")]
    ConcurrencyLimit { in_flight: usize, max: usize },

    /// The coordinator circuit is open and not yet ready to be probed
    #[error("Coordinator circuit is open")]
    CircuitOpen,

    /// The operation did not finish before its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// An alert sink could not deliver an alert
    #[error("Alert delivery failed: {0}")]
    Delivery(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Wrap a redis error with the operation that produced it.
    pub fn coordinator(context: impl Into<String>, source: redis::RedisError) -> Self {
        LimiterError::Coordinator {
            context: context.into(),
            source,
        }
    }

    /// True for the error classes where the caller must pick fail-open,
    /// fail-closed or fallback.
    pub fn is_coordinator_failure(&self) -> bool {
        matches!(
            self,
            LimiterError::Coordinator { .. }
                | LimiterError::Script(_)
                | LimiterError::ConcurrencyLimit { .. }
                | LimiterError::CircuitOpen
                | LimiterError::Timeout(_)
        )
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_failures_are_classified() {
        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(LimiterError::coordinator("ping", io).is_coordinator_failure());
        assert!(LimiterError::Script("bad".into()).is_coordinator_failure());
        assert!(LimiterError::CircuitOpen.is_coordinator_failure());
        assert!(LimiterError::ConcurrencyLimit { in_flight: 2, max: 1 }.is_coordinator_failure());
        assert!(!LimiterError::Config("bad".into()).is_coordinator_failure());
        assert!(!LimiterError::Validation("bad".into()).is_coordinator_failure());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = LimiterError::ConcurrencyLimit { in_flight: 3, max: 2 };
        assert_eq!(
            err.to_string(),
            "Concurrency limit exceeded: 3 in-flight probes (max 2)"
        );
    }
}
