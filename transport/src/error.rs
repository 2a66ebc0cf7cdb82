//! Error types for the polling transport.

use std::time::Duration;

use filepoll_vfs::VfsError;
use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, PollError>;

/// Errors that can occur in the polling transport.
#[derive(Error, Debug)]
pub enum PollError {
    /// The entry's location could not be resolved within the retry bound.
    /// The cycle was aborted and the entry's poll state left untouched.
    #[error("cannot resolve {uri} after {attempts} attempts: {source}")]
    FatalEntryFailure {
        uri: String,
        attempts: u32,
        #[source]
        source: VfsError,
    },

    /// Building a message from a file failed.
    #[error("cannot build message from {uri}: {source}")]
    Build {
        uri: String,
        #[source]
        source: BuildError,
    },

    /// The processing engine rejected a message.
    #[error("dispatch of {uri} failed: {source}")]
    Dispatch {
        uri: String,
        #[source]
        source: EngineError,
    },

    /// Build and dispatch did not finish in time.
    #[error("processing {uri} timed out after {timeout:?}")]
    DispatchTimeout { uri: String, timeout: Duration },

    /// Invalid entry configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid file name pattern.
    #[error("invalid file name pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// File system error.
    #[error("file system error: {0}")]
    Vfs(#[from] VfsError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PollError {
    /// Whether this error stops the whole entry rather than a single file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalEntryFailure { .. })
    }
}

/// Errors raised while turning file content into a message.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Content is not valid for the selected builder.
    #[error("malformed content: {0}")]
    Malformed(String),

    /// The declared character set is not supported.
    #[error("unsupported charset: {0}")]
    UnsupportedCharset(String),

    /// Reading the content failed.
    #[error("read error: {0}")]
    Read(#[from] std::io::Error),

    /// The builder stopped before producing a message.
    #[error("builder did not complete: {0}")]
    Interrupted(String),

    /// File system error.
    #[error("file system error: {0}")]
    Vfs(#[from] VfsError),
}

/// Failure signal returned by a processing engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine refused the message.
    #[error("message rejected: {0}")]
    Rejected(String),

    /// The engine could not be reached or failed internally.
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}
