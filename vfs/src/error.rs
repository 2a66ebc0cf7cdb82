//! Error types for the virtual file system.

use thiserror::Error;

/// Result type alias for file system operations.
pub type Result<T> = std::result::Result<T, VfsError>;

/// Errors that can occur when working with virtual files.
#[derive(Error, Debug)]
pub enum VfsError {
    /// Location could not be resolved.
    #[error("cannot resolve {uri}: {reason}")]
    Resolve { uri: String, reason: String },

    /// No backend is registered for the URI scheme.
    #[error("unknown URI scheme: {0}")]
    UnknownScheme(String),

    /// File does not exist.
    #[error("file not found: {0}")]
    NotFound(String),

    /// The operation does not apply to the file in its current form
    /// (no content, no attributes, or currently being written).
    #[error("invalid state for {uri}: {reason}")]
    InvalidState { uri: String, reason: String },

    /// The content is in use by a conflicting stream.
    #[error("content busy for {uri}: {reason}")]
    Busy { uri: String, reason: String },

    /// The stream has already been closed.
    #[error("stream already closed: {0}")]
    StreamClosed(String),

    /// Operation not supported by the backend.
    #[error("{operation} not supported for {uri}")]
    Unsupported {
        operation: &'static str,
        uri: String,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VfsError {
    pub fn invalid_state(uri: &str, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }

    pub fn busy(uri: &str, reason: impl Into<String>) -> Self {
        Self::Busy {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(operation: &'static str, uri: &str) -> Self {
        Self::Unsupported {
            operation,
            uri: uri.to_string(),
        }
    }

    /// Whether this error means the target is already gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
