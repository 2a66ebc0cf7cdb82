//! Storage capabilities exposed by backends.
//!
//! A backend plugs into the system through three traits:
//!
//! - [`FileSystem`] resolves a URI to a [`FileObject`].
//! - [`FileObject`] answers structural questions (type, children) and
//!   performs the durable side effects (move, delete).
//! - [`ContentProvider`] supplies the raw byte streams and metadata that a
//!   [`FileContent`] wraps and guards.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::content::FileContent;
use crate::error::{Result, VfsError};
use crate::name::{FileName, FileType};

/// Backend specific attributes of a file.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// A DER encoded certificate used to sign a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate(pub Vec<u8>);

/// Raw access to the bytes and metadata of one file.
///
/// Implementations do not track stream state; [`FileContent`] does that.
pub trait ContentProvider: Send + Sync {
    /// URI of the file, used in error messages.
    fn uri(&self) -> String;

    /// Current type of the file.
    fn file_type(&self) -> Result<FileType>;

    /// Size of the content in bytes.
    fn content_size(&self) -> Result<u64>;

    /// Last modification time.
    fn last_modified(&self) -> Result<DateTime<Utc>>;

    /// Set the last modification time.
    fn set_last_modified(&self, _time: DateTime<Utc>) -> Result<()> {
        Err(VfsError::unsupported("set_last_modified", &self.uri()))
    }

    /// All attributes of the file.
    fn attributes(&self) -> Result<Attributes> {
        Ok(Attributes::new())
    }

    /// Set a single attribute.
    fn set_attribute(&self, _name: &str, _value: serde_json::Value) -> Result<()> {
        Err(VfsError::unsupported("set_attribute", &self.uri()))
    }

    /// Remove a single attribute. Removing an unset attribute is not an
    /// error.
    fn remove_attribute(&self, _name: &str) -> Result<()> {
        Err(VfsError::unsupported("remove_attribute", &self.uri()))
    }

    /// Certificates the file was signed with.
    fn certificates(&self) -> Result<Vec<Certificate>> {
        Ok(Vec::new())
    }

    /// Open a raw stream over the content.
    fn input_stream(&self) -> Result<Box<dyn Read + Send>>;

    /// Open a raw stream that replaces the content.
    fn output_stream(&self) -> Result<Box<dyn Write + Send>>;

    /// Open a raw stream that adds to the end of the content.
    fn append_stream(&self) -> Result<Box<dyn Write + Send>> {
        Err(VfsError::unsupported("append", &self.uri()))
    }

    /// Called once the output stream has been closed, so the backend can
    /// commit what was written.
    fn end_output(&self) -> Result<()> {
        Ok(())
    }
}

/// A file or folder in a virtual file system.
#[async_trait]
pub trait FileObject: Send + Sync {
    /// Name of this file.
    fn name(&self) -> &FileName;

    /// Content guard of this file.
    fn content(&self) -> &FileContent;

    /// Current type of the file.
    async fn file_type(&self) -> Result<FileType>;

    /// Whether the file exists.
    async fn exists(&self) -> Result<bool> {
        Ok(self.file_type().await? != FileType::Imaginary)
    }

    /// Whether the file can be read by this process.
    async fn is_readable(&self) -> Result<bool>;

    /// Immediate children of a folder, empty for anything else.
    async fn children(&self) -> Result<Vec<Arc<dyn FileObject>>>;

    /// Resolve a direct child by name. The child need not exist.
    async fn resolve_child(&self, name: &str) -> Result<Arc<dyn FileObject>>;

    /// The folder containing this file, `None` for the root.
    async fn parent(&self) -> Result<Option<Arc<dyn FileObject>>>;

    /// Create this file holding `bytes` unless something already exists
    /// here, in which case nothing is written and `false` is returned.
    ///
    /// The existence check and the creation are a single step: of any
    /// number of concurrent callers, in this process or another, at most
    /// one gets `true`.
    async fn create_exclusive(&self, _bytes: &[u8]) -> Result<bool> {
        Err(VfsError::unsupported("create_exclusive", &self.name().uri()))
    }

    /// Move this file to `dest`, replacing anything already there.
    async fn move_to(&self, dest: &dyn FileObject) -> Result<()>;

    /// Delete this file. Returns `false` when there was nothing to delete.
    async fn delete(&self) -> Result<bool>;

    /// Release every stream held on this file.
    async fn close(&self) -> Result<()> {
        self.content().close_all()
    }
}

impl std::fmt::Debug for dyn FileObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileObject")
            .field("name", &self.name().uri())
            .field("content", self.content())
            .finish()
    }
}

/// Resolves URIs to files.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Resolve `uri` to a file. The file need not exist; failing to reach
    /// the backend at all is an error.
    async fn resolve(&self, uri: &str) -> Result<Arc<dyn FileObject>>;
}

/// Copy the content of `src` into `dest` through their content guards.
pub fn copy_content(src: &dyn FileObject, dest: &dyn FileObject) -> Result<u64> {
    let mut reader = src.content().open_read()?;
    let mut writer = dest.content().open_write()?;
    let copied = std::io::copy(&mut reader, &mut writer)?;
    writer.close()?;
    reader.close();
    Ok(copied)
}
