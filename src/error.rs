//! WolfQuorum Error Types

use thiserror::Error;

/// Result type alias for WolfQuorum operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfQuorum error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Membership errors
    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("Member conflict: {0}")]
    Conflict(String),

    #[error("Quorum violation: {healthy} healthy voting members, {required} required")]
    QuorumViolation { healthy: usize, required: usize },

    #[error("Member not ready: {0}")]
    NotReady(String),

    // Transport errors
    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable (transport-level failures only)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Transport(_))
    }

    /// Check if this error is a safety verdict that must reach the caller
    pub fn is_safety_violation(&self) -> bool {
        matches!(self, Error::QuorumViolation { .. } | Error::Conflict(_))
    }
}
