/// Unified error handling for the portero pooler
///
/// Session-level failures are not errors: they are `SessionOutcome` values
/// consumed by the cleanup policy in `core::session`, and pool failures are
/// `AcquireError` values. The types here cover everything outside a running
/// session: configuration, listener setup and startup-packet handling.
use std::io;
use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for portero operations
#[derive(Debug, Error)]
pub enum PorteroError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Wire protocol errors (malformed frames, bad startup packets)
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type alias for portero operations
pub type PorteroResult<T> = Result<T, PorteroError>;

/// Convenience methods for creating specific error types
impl PorteroError {
    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        PorteroError::Protocol(message.into())
    }

    /// Check if this error is recoverable (the listener keeps accepting)
    pub fn is_recoverable(&self) -> bool {
        match self {
            PorteroError::Network(_) => true,
            PorteroError::Protocol(_) => true,
            PorteroError::Config(_) => false,
        }
    }
}
