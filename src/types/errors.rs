//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Resource not found (unknown service id, unknown manager, …).
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid lifecycle state transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Adding a required dependency edge would create a cycle; service
    /// creation is rejected.
    #[error("dependency cycle: {0}")]
    DependencyCycle(String),

    /// An awaited operation was cancelled (owning service stopped).
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Event queue misuse or shutdown-related failures.
    #[error("queue error: {0}")]
    Queue(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors (signal handler installation).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn dependency_cycle(msg: impl Into<String>) -> Self {
        Self::DependencyCycle(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Failure returned by a service's user-supplied `start`.
///
/// The lifecycle manager transitions the service back to `Installed`;
/// retrying is a user-policy concern (re-push a start event).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("service start failed: {0}")]
pub struct StartError(String);

impl StartError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Observed by a `Task` awaiter when the task's owning service stopped
/// before the task completed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("task cancelled before completion")]
pub struct TaskCancelled;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::not_found("service 7").to_string(),
            "not found: service 7"
        );
        assert_eq!(
            Error::dependency_cycle("a -> b -> a").to_string(),
            "dependency cycle: a -> b -> a"
        );
    }

    #[test]
    fn test_start_error_message() {
        let err = StartError::new("no database");
        assert_eq!(err.to_string(), "service start failed: no database");
        assert_eq!(err.message(), "no database");
    }

    #[test]
    fn test_serde_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
