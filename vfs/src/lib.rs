//! # Virtual File System
//!
//! This crate provides the storage abstraction used by filepoll. Backends
//! (local disk, in-memory, or anything reachable over a protocol) expose a
//! small set of capabilities, and every file's bytes are accessed through a
//! guarded [`FileContent`].
//!
//! ## Features
//!
//! - **Pluggable Backends**: `FileSystem`/`FileObject` traits, routed by URI scheme
//! - **Guarded Content**: One writer or many readers, never both
//! - **Leak-free Streams**: Every open stream is tracked and can be force-closed
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Virtual File System                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  FileSystemManager ──► FileSystem ──► FileObject                │
//! │                           │               │                     │
//! │                           ▼               ▼                     │
//! │                    Local / Memory     FileContent               │
//! │                                           │                     │
//! │                                           ▼                     │
//! │                                  ContentReader / ContentWriter  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod content;
pub mod error;
pub mod local;
pub mod manager;
pub mod memory;
pub mod name;
pub mod object;

pub use content::{ContentReader, ContentState, ContentWriter, FileContent};
pub use error::{Result, VfsError};
pub use local::{LocalFile, LocalFileSystem};
pub use manager::FileSystemManager;
pub use memory::{MemoryFile, MemoryFileSystem};
pub use name::{FileName, FileType, mask_uri_password};
pub use object::{Attributes, Certificate, ContentProvider, FileObject, FileSystem, copy_content};
