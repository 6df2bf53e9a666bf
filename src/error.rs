//! Top-level error types for relaybot.

use std::time::Duration;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to load {path}: {source}")]
    Load {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// State store (Redis) errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to get connection from pool: {0}")]
    Pool(String),

    #[error("state command failed: {0}")]
    Command(String),

    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

impl From<deadpool_redis::PoolError> for StateError {
    fn from(error: deadpool_redis::PoolError) -> Self {
        StateError::Pool(error.to_string())
    }
}

impl From<deadpool_redis::redis::RedisError> for StateError {
    fn from(error: deadpool_redis::redis::RedisError) -> Self {
        if error.is_connection_refusal() || error.is_timeout() || error.is_connection_dropped() {
            StateError::Unavailable(error.to_string())
        } else {
            StateError::Command(error.to_string())
        }
    }
}

/// Slack error codes that are worth retrying with backoff.
const TRANSIENT_API_CODES: &[&str] = &[
    "ratelimited",
    "rate_limited",
    "internal_error",
    "unknown_error",
];

/// Chat platform errors, classified for the retry envelope.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// HTTP 429 or equivalent. When the platform supplied a Retry-After
    /// delay, the caller sleeps exactly that long before retrying.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// A structured platform error code (e.g. `channel_not_found`).
    #[error("platform error: {code}")]
    Api { code: String },

    /// Transport-level failure (connection, TLS, serialization).
    #[error("transport error: {0}")]
    Transport(String),
}

impl ChatError {
    /// Whether the retry envelope should back off and try again.
    pub fn is_transient(&self) -> bool {
        match self {
            ChatError::RateLimited { .. } => true,
            ChatError::Api { code } => TRANSIENT_API_CODES.contains(&code.as_str()),
            ChatError::Transport(_) => false,
        }
    }

    /// Explicit server-provided retry delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ChatError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Forward job encoding/decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job is missing required field: {0}")]
    MissingField(&'static str),

    #[error("job field {field} has invalid value: {value}")]
    Invalid { field: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_matches_retry_policy() {
        for code in ["ratelimited", "rate_limited", "internal_error", "unknown_error"] {
            assert!(ChatError::Api { code: code.into() }.is_transient(), "{code}");
        }
        assert!(!ChatError::Api { code: "channel_not_found".into() }.is_transient());
        assert!(!ChatError::Transport("connection reset".into()).is_transient());
        assert!(
            ChatError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
            .is_transient()
        );
    }

    #[test]
    fn retry_after_only_surfaces_on_rate_limits() {
        let limited = ChatError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(ChatError::Api { code: "internal_error".into() }.retry_after(), None);
    }
}
