//! Error types for the archival subsystem.
//!
//! Startup errors (`Parse`, `Config`) are fatal. Everything else is
//! recovered by the daemon on its next poll cycle.

use std::io;
use thiserror::Error;

/// Main error type for VDA operations.
#[derive(Error, Debug)]
pub enum VdaError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Command `{command}` failed with status {status}")]
    Subprocess { command: String, status: i32 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VdaError {
    /// Whether the failed work will be retried by a later pass.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VdaError::Store(_) | VdaError::Subprocess { .. } | VdaError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(VdaError::Store("connection lost".into()).is_retryable());
        assert!(VdaError::Subprocess {
            command: "encoder".into(),
            status: 1
        }
        .is_retryable());
        assert!(!VdaError::Parse("bad policy".into()).is_retryable());
        assert!(!VdaError::Config("zero hosts".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = VdaError::Subprocess {
            command: "decoder data.vda".into(),
            status: 2,
        };
        assert_eq!(
            err.to_string(),
            "Command `decoder data.vda` failed with status 2"
        );
    }
}
