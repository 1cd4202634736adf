//! Error handling module for mlnode
//!
//! Provides the crate-wide error type using thiserror. Module-local taxonomies
//! (`MarkerError`, `SequenceError`) convert into it at the binary boundary.
//! Step actions and collaborators use `anyhow` instead, because the sequencer
//! only carries their cause to the operator and never inspects it.

use thiserror::Error;

use crate::marker::MarkerError;
use crate::sequencer::SequenceError;

/// Main error type for mlnode
#[derive(Error, Debug)]
pub enum SetupError {
    /// IO errors (config files, state directory)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (loading, parsing)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors (config values, CLI arguments)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Progress marker errors
    #[error(transparent)]
    Marker(#[from] MarkerError),

    /// Sequencer errors (stale state, malformed sequence)
    #[error(transparent)]
    Sequence(#[from] SequenceError),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for mlnode operations
pub type Result<T> = std::result::Result<T, SetupError>;

impl SetupError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Process exit code the binary uses when this error aborts a command.
    ///
    /// Stale progress state gets its own code so wrappers can tell "someone
    /// changed the step list" apart from an ordinary failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Sequence(SequenceError::StaleState { .. }) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SetupError::config("missing field");
        assert_eq!(err.to_string(), "Configuration error: missing field");

        let err = SetupError::validation("model name is empty");
        assert_eq!(err.to_string(), "Validation error: model name is empty");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SetupError = io_err.into();
        assert!(matches!(err, SetupError::Io(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_stale_state_exit_code() {
        let err: SetupError = SequenceError::StaleState {
            marker: "old-step".to_string(),
        }
        .into();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("old-step"));
    }
}
