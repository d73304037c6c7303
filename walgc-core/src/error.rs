//! Error types for the WAL garbage collector

use std::io;
use thiserror::Error;

/// Result type alias for collector operations
pub type Result<T> = std::result::Result<T, GcError>;

/// Failures reported by the coordination service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// The requested node does not exist
    #[error("no node at {0}")]
    NoNode(String),

    /// The service could not answer (connection loss, session expiry, ...)
    #[error("coordination service unavailable: {0}")]
    Unavailable(String),
}

/// Collector error types
#[derive(Error, Debug)]
pub enum GcError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Scanning the metadata table failed
    #[error("Metadata scan error: {0}")]
    Metadata(String),

    /// Coordination service error
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// RPC transport failure
    #[error("Transport error talking to {server}: {reason}")]
    Transport { server: String, reason: String },

    /// RPC did not complete in time
    #[error("Timed out talking to {0}")]
    Timeout(String),

    /// Server identifier is not a host:port pair
    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GcError {
    /// Convenience constructor for transport failures
    pub fn transport(server: impl ToString, reason: impl ToString) -> Self {
        GcError::Transport {
            server: server.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Check if the error means the target file or directory is gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, GcError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }

    /// Check if the error must abort the whole cycle.
    ///
    /// Only an incomplete view of the metadata table qualifies; everything
    /// else is retried on the next cycle.
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(self, GcError::Metadata(_))
    }

    /// Check if the error comes from talking to a tablet server
    pub fn is_transport(&self) -> bool {
        matches!(self, GcError::Transport { .. } | GcError::Timeout(_))
    }
}
