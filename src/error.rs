//! Error types for taskctx.

use std::time::Duration;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Why a context's done signal fired.
///
/// These are the only terminal conditions a context can reach. Once one is
/// recorded it never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Task registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Maximum live tasks ({max}) exceeded")]
    CapacityExceeded { max: usize },

    #[error("Task {id} is already registered")]
    DuplicateId { id: i64 },

    #[error("Task {id} not found")]
    NotFound { id: i64 },

    #[error("Registry is shutting down")]
    ShuttingDown,

    #[error("{remaining} task(s) still running after {grace:?} shutdown grace")]
    ShutdownTimedOut { remaining: usize, grace: Duration },
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_error_messages() {
        assert_eq!(ContextError::Cancelled.to_string(), "context cancelled");
        assert_eq!(
            ContextError::DeadlineExceeded.to_string(),
            "context deadline exceeded"
        );
    }

    #[test]
    fn registry_error_converts_into_top_level() {
        let err: Error = RegistryError::NotFound { id: 9 }.into();
        assert!(matches!(err, Error::Registry(RegistryError::NotFound { id: 9 })));
        assert_eq!(err.to_string(), "Registry error: Task 9 not found");
    }
}
