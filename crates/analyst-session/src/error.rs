//! Error types shared by the session services.
//!
//! Expected outcomes are not errors here: an invalid refresh token is an
//! `is_valid = false` validation, a rejected request is a denied
//! [`RateLimitDecision`](crate::rate_limit::RateLimitDecision). `SessionError`
//! is reserved for misuse and for an unavailable or misbehaving backend.

use std::time::Duration;

/// Errors produced by the cache, rate limiter and token store.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The persistent store rejected or failed a command.
    #[error("Backend error: {message}")]
    Backend {
        /// Description of the backend failure.
        message: String,
    },

    /// A single round trip to the persistent store did not finish in time.
    #[error("Backend timeout: {operation} did not complete within {after:?}")]
    Timeout {
        /// The command that stalled.
        operation: &'static str,
        /// The configured timeout.
        after: Duration,
    },

    /// The caller passed an argument outside the operation's contract.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the violated constraint.
        message: String,
    },

    /// The service configuration is unusable.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A value could not be encoded for storage.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the encoding failure.
        message: String,
    },
}

impl SessionError {
    /// Creates a new `Backend` error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidArgument` error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns `true` if the error means the backend could not serve the
    /// request, as opposed to the caller misusing the API.
    #[must_use]
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Self::Backend { .. } | Self::Timeout { .. })
    }
}

impl From<redis::RedisError> for SessionError {
    fn from(err: redis::RedisError) -> Self {
        Self::backend(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for SessionError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::backend(format!("connection pool: {err}"))
    }
}

impl From<deadpool_redis::CreatePoolError> for SessionError {
    fn from(err: deadpool_redis::CreatePoolError) -> Self {
        Self::configuration(format!("failed to create Redis pool: {err}"))
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_failure_classification() {
        assert!(SessionError::backend("down").is_backend_failure());
        assert!(
            SessionError::Timeout {
                operation: "GET",
                after: Duration::from_millis(50),
            }
            .is_backend_failure()
        );
        assert!(!SessionError::invalid_argument("limit must be > 0").is_backend_failure());
        assert!(!SessionError::configuration("bad url").is_backend_failure());
    }

    #[test]
    fn test_display() {
        let err = SessionError::invalid_argument("window must be > 0");
        assert_eq!(err.to_string(), "Invalid argument: window must be > 0");
    }
}
