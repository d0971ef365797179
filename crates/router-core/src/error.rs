//! Error types for the copy-trading router.

use thiserror::Error;

/// Failure taxonomy for pool service calls.
///
/// Transport failures and broker rejections are distinct variants so that a
/// caller can never mistake "the pool did not answer" for "the broker has no
/// positions". `positions` in particular must surface `Transport` instead of
/// an empty list.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Network-level failure: reset, timeout, 5xx, 429, or a body that could
    /// not be decoded into the expected shape.
    #[error("pool transport failed: {message}")]
    Transport {
        message: String,
        /// Upstream restart / connection refused. Does not count toward the
        /// per-account failure counter.
        connection_refused: bool,
    },

    /// The broker rejected the request (non-retryable 4xx).
    #[error("broker rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The broker does not know the referenced position.
    #[error("unknown position")]
    UnknownPosition,
}

impl PoolError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            connection_refused: false,
        }
    }

    pub fn connection_refused(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            connection_refused: true,
        }
    }

    /// Whether a retry may succeed (transport-level failures only).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Whether this failure counts toward the per-account breaker counter.
    pub fn counts_for_breaker(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                connection_refused: false,
                ..
            }
        )
    }
}

pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Mapping store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mapping store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Configuration errors. Fatal at startup, recoverable at hot reload.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("environment variable {0} not set")]
    MissingEnv(&'static str),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse routing config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_is_retryable() {
        assert!(PoolError::transport("timeout").is_retryable());
        assert!(PoolError::connection_refused("refused").is_retryable());
        assert!(!PoolError::UnknownPosition.is_retryable());
        assert!(!PoolError::Rejected {
            status: 400,
            message: "invalid volume".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn test_connection_refused_does_not_count() {
        assert!(PoolError::transport("reset").counts_for_breaker());
        assert!(!PoolError::connection_refused("refused").counts_for_breaker());
        assert!(!PoolError::UnknownPosition.counts_for_breaker());
    }
}
