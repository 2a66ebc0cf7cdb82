//! The contract between the transport and the engine that consumes messages.

use std::collections::BTreeMap;

use async_trait::async_trait;
use filepoll_vfs::FileObject;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::builder::{ContentType, Message, MessageBody};
use crate::error::EngineError;

/// Header holding the file's path within its backend.
pub const FILE_PATH: &str = "FILE_PATH";

/// Header holding the file's base name.
pub const FILE_NAME: &str = "FILE_NAME";

/// Header holding the content length in bytes.
pub const FILE_LENGTH: &str = "FILE_LENGTH";

/// Header holding the last modification time, in milliseconds since the
/// Unix epoch.
pub const LAST_MODIFIED: &str = "LAST_MODIFIED";

/// Headers describing the file a message came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportHeaders(BTreeMap<String, String>);

impl TransportHeaders {
    /// Create an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers for `file`. Length and modification time are left out when
    /// the backend cannot report them.
    pub fn for_file(file: &dyn FileObject) -> Self {
        let mut headers = Self::new();
        headers.insert(FILE_PATH, file.name().path());
        headers.insert(FILE_NAME, file.name().base_name());

        let content = file.content();
        if let Ok(size) = content.size() {
            headers.insert(FILE_LENGTH, size.to_string());
        }
        if let Ok(modified) = content.last_modified() {
            headers.insert(LAST_MODIFIED, modified.timestamp_millis().to_string());
        }
        headers
    }

    /// Set a header.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// A header's value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate headers in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Where correlated replies should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTo {
    /// Reply location.
    pub uri: String,

    /// Whether the replying side should lock what it writes.
    pub locking: bool,
}

/// Everything the engine receives for one file.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub message: Message,
    pub headers: TransportHeaders,
    pub content_type: Option<ContentType>,
    pub reply_to: Option<ReplyTo>,
}

impl DispatchRequest {
    /// See [`Message::detach`].
    pub fn detach(self) -> Result<Self, EngineError> {
        let message = self
            .message
            .detach()
            .map_err(|e| EngineError::Unavailable(format!("cannot read streamed content: {e}")))?;
        Ok(Self { message, ..self })
    }
}

/// Consumes messages built from polled files.
#[async_trait]
pub trait MessageEngine: Send + Sync {
    /// Process one message. An error marks the file as failed.
    ///
    /// The file is disposed of as soon as this returns, so a
    /// [`MessageBody::Streamed`] body
    /// must be consumed before then.
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), EngineError>;
}

/// Engine that forwards every request into a channel.
///
/// Streamed bodies are read into memory before the request is queued,
/// since the receiver runs after the file is gone.
#[derive(Debug, Clone)]
pub struct ChannelEngine {
    tx: mpsc::Sender<DispatchRequest>,
}

impl ChannelEngine {
    /// Create an engine and the receiving end of its channel.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<DispatchRequest>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageEngine for ChannelEngine {
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), EngineError> {
        let request = if matches!(request.message.body, MessageBody::Streamed(_)) {
            tokio::task::spawn_blocking(move || request.detach())
                .await
                .map_err(|e| EngineError::Unavailable(e.to_string()))??
        } else {
            request
        };

        self.tx
            .send(request)
            .await
            .map_err(|_| EngineError::Unavailable("receiver dropped".to_string()))
    }
}
