//! Error types for Parley.
//!
//! Every component returns explicit results built from these types. Callers
//! above the core (HTTP handlers, the CLI) use [`Error::is_client_error`] to
//! pick a 4xx- or 5xx-style response.

use thiserror::Error;

/// Result type alias using the Parley error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Parley.
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown session id
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Session id prefix matched more than one session
    #[error("Ambiguous session prefix '{prefix}': matches {count} sessions")]
    AmbiguousPrefix { prefix: String, count: usize },

    /// Malformed input such as compression thresholds
    #[error("Validation error: {0}")]
    Validation(String),

    /// Durable storage failed
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// External summarizer failed
    #[error("Summarization failed: {0}")]
    Summarization(String),

    /// Session changed underneath an operation that needed a stable view
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The persistence layer no longer accepts work
    #[error("Persistence manager is shutting down")]
    ShuttingDown,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broken internal invariant
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller caused the error (4xx class) rather than the system (5xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::AmbiguousPrefix { .. }
                | Error::Validation(_)
                | Error::Conflict(_)
        )
    }

    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::NotFound(_) => Some("Use 'parley session list' to see available sessions"),
            Error::AmbiguousPrefix { .. } => Some("Use a longer session ID prefix"),
            Error::Validation(_) => Some("Check the compression thresholds and percentages"),
            Error::Storage(StorageError::Closed) => Some("Restart the process to reopen storage"),
            Error::Storage(_) => Some("Check that the data directory is writable"),
            Error::Conflict(_) => Some("Retry the operation"),
            Error::Config(_) => Some("Check your config file at ~/.config/parley/config.toml"),
            _ => None,
        }
    }
}

/// Errors raised by storage backends.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid session key: {0}")]
    InvalidKey(String),

    #[error("Storage is closed")]
    Closed,
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(Error::NotFound("abc".into()).is_client_error());
        assert!(Error::Validation("bad".into()).is_client_error());
        assert!(!Error::Storage(StorageError::Closed).is_client_error());
        assert!(!Error::Internal("oops".into()).is_client_error());
    }

    #[test]
    fn test_storage_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = StorageError::from(io).into();
        assert!(err.to_string().contains("denied"));
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_format_with_suggestion() {
        let output = format_error_with_suggestion(&Error::NotFound("abc".into()));
        assert!(output.contains("Session not found: abc"));
        assert!(output.contains("Suggestion"));
    }
}
