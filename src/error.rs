//! Error types for the reverb capture/replay core

use std::io;
use thiserror::Error;

/// Result type alias for reverb operations
pub type Result<T> = std::result::Result<T, ReverbError>;

/// Main error type for reverb
#[derive(Error, Debug)]
pub enum ReverbError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file parsing errors
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Capture source errors (read or commit failures)
    #[error("Capture source error: {0}")]
    Source(String),

    /// An observation that cannot be applied to the connection's state machine
    #[error("Malformed observation for {key}: {reason}")]
    MalformedObservation { key: String, reason: String },

    /// Failed to establish a target-side channel
    #[error("Failed to connect to target for {0}")]
    Connect(String),

    /// Transport failure while sending packets or reading the response
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// Work was tagged with a generation older than the session's
    #[error("Session superseded: work generation {work} < session generation {session}")]
    SessionSuperseded { work: u32, session: u32 },

    /// The session executed its scheduled close before this work ran
    #[error("Session closed")]
    SessionClosed,

    /// The session was cancelled before this work ran
    #[error("Session cancelled")]
    Cancelled,

    /// Pool is shutting down
    #[error("Connection pool is shutting down")]
    Shutdown,

    /// Internal invariant violation; the affected connection stops processing
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_yaml::Error> for ReverbError {
    fn from(err: serde_yaml::Error) -> Self {
        ReverbError::ConfigParse(err.to_string())
    }
}

impl From<toml::de::Error> for ReverbError {
    fn from(err: toml::de::Error) -> Self {
        ReverbError::ConfigParse(err.to_string())
    }
}

impl ReverbError {
    /// Whether the retry policy is allowed to act on this error.
    ///
    /// Fatal violations (broken invariants) and lifecycle terminations are
    /// not retryable; transport-level failures and supersessions are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReverbError::Connect(_)
                | ReverbError::Transport(_)
                | ReverbError::Timeout
                | ReverbError::SessionSuperseded { .. }
                | ReverbError::SessionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ReverbError::Transport("reset".into()).is_retryable());
        assert!(ReverbError::Timeout.is_retryable());
        assert!(ReverbError::SessionSuperseded { work: 1, session: 2 }.is_retryable());
        assert!(!ReverbError::Internal("bug".into()).is_retryable());
        assert!(!ReverbError::Cancelled.is_retryable());
    }
}
