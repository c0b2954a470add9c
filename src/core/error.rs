// This module defines the error type shared by every mid-end pass, using the thiserror
// crate for idiomatic error handling. PassError covers the failure classes a pass can
// report: failed preconditions and unimplemented graph shapes (the input graph does not
// satisfy a documented prerequisite), internal invariant violations, invalid matcher
// patterns, the fatal custom-op configuration error, textual module parse errors,
// errors surfaced by the code generator's engine build step and bad configuration
// values. PassResult<T> is the convenience alias used throughout. Local search failures
// (a candidate that does not validate) are never errors; passes skip those and carry on.

//! Error types for the mid-end passes.

use thiserror::Error;

/// Main error type for pass execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PassError {
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A custom op claims layout sensitivity but carries no
    /// `layout_dependencies` map. Compilation must stop.
    #[error("Custom op {instruction} is missing 'layout_dependencies' field")]
    MissingLayoutDependencies { instruction: String },

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Backend engine build failed: {0}")]
    Backend(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PassError {
    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        PassError::FailedPrecondition(msg.into())
    }

    pub fn unimplemented(msg: impl Into<String>) -> Self {
        PassError::Unimplemented(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        PassError::Internal(msg.into())
    }

    /// Fatal errors are contract violations by an op author; the driver must
    /// not run any further pass after seeing one.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PassError::MissingLayoutDependencies { .. })
    }
}

/// Result type alias for pass operations.
pub type PassResult<T> = Result<T, PassError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PassError::unimplemented("stage root is not a tuple");
        assert_eq!(err.to_string(), "Unimplemented: stage root is not a tuple");

        let err = PassError::Parse { line: 3, message: "expected '='".to_string() };
        assert_eq!(err.to_string(), "Parse error at line 3: expected '='");
    }

    #[test]
    fn test_only_missing_layout_dependencies_is_fatal() {
        assert!(PassError::MissingLayoutDependencies { instruction: "%c".into() }.is_fatal());
        assert!(!PassError::internal("x").is_fatal());
        assert!(!PassError::failed_precondition("x").is_fatal());
    }
}
