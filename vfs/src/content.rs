//! Stream lifecycle management for file content.
//!
//! [`FileContent`] is the single gate through which a file's bytes are read
//! or written. It enforces one writer or many readers, never both, and keeps
//! a registry of every open stream so that [`FileContent::close_all`] can
//! release them no matter which code path opened them.
//!
//! ```text
//!            open_read                    open_write
//!   ┌──────┐ ─────────► ┌─────────┐      ┌──────┐ ──────────► ┌─────────┐
//!   │ Idle │            │ Reading │      │ Idle │             │ Writing │
//!   └──────┘ ◄───────── └─────────┘      └──────┘ ◄────────── └─────────┘
//!          last reader closed                   writer closed
//! ```
//!
//! Streams are closed explicitly, by reaching end of input, by being dropped,
//! or by `close_all`. Each path is idempotent.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, VfsError};
use crate::name::FileType;
use crate::object::{Attributes, Certificate, ContentProvider};

/// Which kind of stream currently holds the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentState {
    /// No open streams.
    #[default]
    Idle,

    /// One or more read streams are open.
    Reading,

    /// The single write stream is open.
    Writing,
}

type ReadSlot = Arc<Mutex<Option<Box<dyn Read + Send>>>>;
type WriteSlot = Arc<Mutex<Option<Box<dyn Write + Send>>>>;

#[derive(Default)]
struct Registry {
    state: ContentState,
    last_id: u64,
    readers: HashMap<u64, ReadSlot>,
    writer: Option<(u64, WriteSlot)>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }
}

struct Shared {
    provider: Arc<dyn ContentProvider>,
    registry: Mutex<Registry>,
}

impl Shared {
    fn end_input(&self, id: u64) {
        let mut registry = self.registry.lock();
        if registry.readers.remove(&id).is_some()
            && registry.readers.is_empty()
            && registry.state == ContentState::Reading
        {
            registry.state = ContentState::Idle;
        }
    }

    fn end_output(&self, id: u64) -> Result<()> {
        {
            let mut registry = self.registry.lock();
            let owns_slot = matches!(registry.writer, Some((current, _)) if current == id);
            if !owns_slot {
                // Already released by close_all, which notified the provider.
                return Ok(());
            }
            registry.writer = None;
            registry.state = ContentState::Idle;
        }
        self.provider.end_output()
    }
}

/// Guarded access to the content of one file.
pub struct FileContent {
    shared: Arc<Shared>,
}

impl FileContent {
    /// Wrap a provider's raw content.
    pub fn new(provider: Arc<dyn ContentProvider>) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    fn uri(&self) -> String {
        self.shared.provider.uri()
    }

    fn require_attributes(&self) -> Result<()> {
        if self.shared.provider.file_type()?.has_attributes() {
            Ok(())
        } else {
            Err(VfsError::invalid_state(
                &self.uri(),
                "file has no attributes",
            ))
        }
    }

    /// Current stream state.
    pub fn state(&self) -> ContentState {
        self.shared.registry.lock().state
    }

    /// Number of tracked read streams.
    pub fn open_reader_count(&self) -> usize {
        self.shared.registry.lock().readers.len()
    }

    /// Whether the write stream is open.
    pub fn has_open_writer(&self) -> bool {
        self.shared.registry.lock().writer.is_some()
    }

    /// Whether any stream is open.
    pub fn is_open(&self) -> bool {
        self.state() != ContentState::Idle
    }

    /// Size of the content in bytes.
    pub fn size(&self) -> Result<u64> {
        if !self.shared.provider.file_type()?.has_content() {
            return Err(VfsError::invalid_state(&self.uri(), "file has no content"));
        }
        if self.state() == ContentState::Writing {
            return Err(VfsError::invalid_state(
                &self.uri(),
                "size is unknown while the content is being written",
            ));
        }
        self.shared.provider.content_size()
    }

    /// Last modification time.
    pub fn last_modified(&self) -> Result<DateTime<Utc>> {
        self.require_attributes()?;
        self.shared.provider.last_modified()
    }

    /// Set the last modification time.
    pub fn set_last_modified(&self, time: DateTime<Utc>) -> Result<()> {
        self.require_attributes()?;
        self.shared.provider.set_last_modified(time)
    }

    /// All attributes of the file.
    pub fn attributes(&self) -> Result<Attributes> {
        self.require_attributes()?;
        self.shared.provider.attributes()
    }

    /// A single attribute, `None` when unset.
    pub fn attribute(&self, name: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.attributes()?.remove(name))
    }

    /// Whether an attribute is set.
    pub fn has_attribute(&self, name: &str) -> Result<bool> {
        Ok(self.attributes()?.contains_key(name))
    }

    /// Set a single attribute.
    pub fn set_attribute(&self, name: &str, value: serde_json::Value) -> Result<()> {
        self.require_attributes()?;
        self.shared.provider.set_attribute(name, value)
    }

    /// Remove a single attribute.
    pub fn remove_attribute(&self, name: &str) -> Result<()> {
        self.require_attributes()?;
        self.shared.provider.remove_attribute(name)
    }

    /// Certificates the file was signed with.
    pub fn certificates(&self) -> Result<Vec<Certificate>> {
        if self.shared.provider.file_type()? == FileType::Imaginary {
            return Err(VfsError::invalid_state(&self.uri(), "file does not exist"));
        }
        self.shared.provider.certificates()
    }

    /// Open a new read stream. Any number may be open at once, but not
    /// while the content is being written.
    pub fn open_read(&self) -> Result<ContentReader> {
        let mut registry = self.shared.registry.lock();
        if registry.state == ContentState::Writing {
            return Err(VfsError::busy(&self.uri(), "content is being written"));
        }

        let raw = self.shared.provider.input_stream()?;
        let id = registry.next_id();
        let slot: ReadSlot = Arc::new(Mutex::new(Some(raw)));
        registry.readers.insert(id, slot.clone());
        registry.state = ContentState::Reading;

        Ok(ContentReader {
            id,
            slot,
            shared: self.shared.clone(),
            eof: false,
        })
    }

    /// Open the write stream, replacing the content. Fails unless no
    /// stream is open.
    pub fn open_write(&self) -> Result<ContentWriter> {
        self.open_writer(false)
    }

    /// Open the write stream positioned at the end of the existing content.
    /// Same rules as [`open_write`](Self::open_write).
    pub fn open_write_append(&self) -> Result<ContentWriter> {
        self.open_writer(true)
    }

    fn open_writer(&self, append: bool) -> Result<ContentWriter> {
        let mut registry = self.shared.registry.lock();
        match registry.state {
            ContentState::Idle => {}
            ContentState::Reading => {
                return Err(VfsError::busy(&self.uri(), "content is being read"));
            }
            ContentState::Writing => {
                return Err(VfsError::busy(&self.uri(), "content is already being written"));
            }
        }

        let raw = if append {
            self.shared.provider.append_stream()?
        } else {
            self.shared.provider.output_stream()?
        };
        let id = registry.next_id();
        let slot: WriteSlot = Arc::new(Mutex::new(Some(raw)));
        registry.writer = Some((id, slot.clone()));
        registry.state = ContentState::Writing;

        Ok(ContentWriter {
            id,
            slot,
            shared: self.shared.clone(),
        })
    }

    /// Close every open stream and return to [`ContentState::Idle`].
    ///
    /// All streams are closed even if one of them fails; the first failure
    /// is returned afterwards.
    pub fn close_all(&self) -> Result<()> {
        let (readers, writer) = {
            let mut registry = self.shared.registry.lock();
            registry.state = ContentState::Idle;
            let readers: Vec<ReadSlot> = registry.readers.drain().map(|(_, s)| s).collect();
            (readers, registry.writer.take())
        };

        if !readers.is_empty() {
            debug!("Closing {} read streams on {}", readers.len(), self.uri());
        }
        for slot in readers {
            drop(slot.lock().take());
        }

        let Some((_, slot)) = writer else {
            return Ok(());
        };
        let stream = slot.lock().take();
        let flushed = match stream {
            Some(mut stream) => stream.flush().map_err(VfsError::from),
            None => Ok(()),
        };
        let ended = self.shared.provider.end_output();
        flushed.and(ended)
    }
}

impl std::fmt::Debug for FileContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.shared.registry.lock();
        f.debug_struct("FileContent")
            .field("state", &registry.state)
            .field("readers", &registry.readers.len())
            .field("writer", &registry.writer.is_some())
            .finish()
    }
}

/// A tracked read stream over file content.
///
/// The stream closes itself at end of input and when dropped.
pub struct ContentReader {
    id: u64,
    slot: ReadSlot,
    shared: Arc<Shared>,
    eof: bool,
}

impl ContentReader {
    /// Close the stream.
    pub fn close(self) {
        drop(self);
    }

    /// Whether the stream has been closed, by any path.
    pub fn is_closed(&self) -> bool {
        self.slot.lock().is_none()
    }

    fn release(&self) {
        drop(self.slot.lock().take());
        self.shared.end_input(self.id);
    }
}

impl Read for ContentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let read = {
            let mut guard = self.slot.lock();
            match guard.as_mut() {
                Some(stream) => stream.read(buf)?,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        VfsError::StreamClosed(self.shared.provider.uri()),
                    ));
                }
            }
        };
        if read == 0 && !buf.is_empty() {
            self.eof = true;
            self.release();
        }
        Ok(read)
    }
}

impl std::fmt::Debug for ContentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentReader")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ContentReader {
    fn drop(&mut self) {
        self.release();
    }
}

/// The tracked write stream over file content.
///
/// Closing the stream tells the backend that output has ended.
pub struct ContentWriter {
    id: u64,
    slot: WriteSlot,
    shared: Arc<Shared>,
}

impl ContentWriter {
    /// Flush and close the stream, then let the backend commit.
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    /// Whether the stream has been closed, by any path.
    pub fn is_closed(&self) -> bool {
        self.slot.lock().is_none()
    }

    fn finish(&mut self) -> Result<()> {
        let Some(mut stream) = self.slot.lock().take() else {
            return Ok(());
        };
        let flushed = stream.flush().map_err(VfsError::from);
        drop(stream);
        let ended = self.shared.end_output(self.id);
        flushed.and(ended)
    }

    fn closed_error(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::BrokenPipe,
            VfsError::StreamClosed(self.shared.provider.uri()),
        )
    }
}

impl Write for ContentWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.slot.lock();
        match guard.as_mut() {
            Some(stream) => stream.write(buf),
            None => Err(self.closed_error()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self.slot.lock();
        match guard.as_mut() {
            Some(stream) => stream.flush(),
            None => Err(self.closed_error()),
        }
    }
}

impl std::fmt::Debug for ContentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentWriter")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ContentWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("Failed to close output of {}: {e}", self.shared.provider.uri());
        }
    }
}
