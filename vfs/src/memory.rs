//! In-memory backend for `mem://` URIs.
//!
//! Useful as a stand-in for remote backends: the whole tree can be taken
//! offline to simulate an unreachable endpoint, and written content only
//! becomes visible once the writer is closed, like an upload that commits on
//! completion.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::content::FileContent;
use crate::error::{Result, VfsError};
use crate::name::{FileName, FileType, split_scheme};
use crate::object::{Attributes, ContentProvider, FileObject, FileSystem, copy_content};

/// URI scheme served by [`MemoryFileSystem`].
pub const MEMORY_SCHEME: &str = "mem";

#[derive(Debug, Clone)]
enum NodeKind {
    File(Vec<u8>),
    Folder,
}

#[derive(Debug, Clone)]
struct MemoryNode {
    kind: NodeKind,
    modified: DateTime<Utc>,
    readable: bool,
    attributes: Attributes,
}

impl MemoryNode {
    fn folder() -> Self {
        Self {
            kind: NodeKind::Folder,
            modified: Utc::now(),
            readable: true,
            attributes: Attributes::new(),
        }
    }

    fn file(bytes: Vec<u8>) -> Self {
        Self {
            kind: NodeKind::File(bytes),
            ..Self::folder()
        }
    }

    fn file_type(&self) -> FileType {
        match self.kind {
            NodeKind::File(_) => FileType::File,
            NodeKind::Folder => FileType::Folder,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryTree {
    nodes: RwLock<BTreeMap<String, MemoryNode>>,
    offline: AtomicBool,
}

impl MemoryTree {
    fn file_type(&self, path: &str) -> FileType {
        self.nodes
            .read()
            .get(path)
            .map_or(FileType::Imaginary, MemoryNode::file_type)
    }

    fn ensure_folders(nodes: &mut BTreeMap<String, MemoryNode>, name: &FileName) {
        let mut parent = name.parent();
        while let Some(folder) = parent {
            nodes
                .entry(folder.path().to_string())
                .or_insert_with(MemoryNode::folder);
            parent = folder.parent();
        }
    }

    fn ensure_online(&self, name: &FileName) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(VfsError::Resolve {
                uri: name.uri(),
                reason: "backend offline".to_string(),
            });
        }
        Ok(())
    }

    fn put_file(&self, path: &str, bytes: Vec<u8>) {
        let name = FileName::new(MEMORY_SCHEME, path);
        let mut nodes = self.nodes.write();
        Self::ensure_folders(&mut nodes, &name);
        let node = nodes
            .entry(name.path().to_string())
            .or_insert_with(|| MemoryNode::file(Vec::new()));
        node.kind = NodeKind::File(bytes);
        node.modified = Utc::now();
    }
}

/// File system held entirely in memory.
///
/// Clones share the same tree.
#[derive(Debug, Clone)]
pub struct MemoryFileSystem {
    tree: Arc<MemoryTree>,
}

impl MemoryFileSystem {
    /// Create an empty file system containing only the root folder.
    pub fn new() -> Self {
        let tree = MemoryTree::default();
        tree.nodes.write().insert("/".to_string(), MemoryNode::folder());
        Self {
            tree: Arc::new(tree),
        }
    }

    /// Create a folder and any missing ancestors.
    pub fn create_folder(&self, path: &str) {
        let name = FileName::new(MEMORY_SCHEME, path);
        let mut nodes = self.tree.nodes.write();
        MemoryTree::ensure_folders(&mut nodes, &name);
        nodes
            .entry(name.path().to_string())
            .or_insert_with(MemoryNode::folder);
    }

    /// Create or replace a file, creating missing ancestors.
    pub fn write_file(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        self.tree.put_file(path, bytes.into());
    }

    /// Content of a file, `None` if there is no such file.
    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        let name = FileName::new(MEMORY_SCHEME, path);
        match self.tree.nodes.read().get(name.path()) {
            Some(MemoryNode {
                kind: NodeKind::File(bytes),
                ..
            }) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// Whether anything exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        let name = FileName::new(MEMORY_SCHEME, path);
        self.tree.file_type(name.path()) != FileType::Imaginary
    }

    /// Remove a node without going through a file object.
    pub fn remove(&self, path: &str) -> bool {
        let name = FileName::new(MEMORY_SCHEME, path);
        self.tree.nodes.write().remove(name.path()).is_some()
    }

    /// Mark a node as readable or not.
    pub fn set_readable(&self, path: &str, readable: bool) {
        let name = FileName::new(MEMORY_SCHEME, path);
        if let Some(node) = self.tree.nodes.write().get_mut(name.path()) {
            node.readable = readable;
        }
    }

    /// Set an attribute on a node.
    pub fn set_attribute(&self, path: &str, attr: &str, value: serde_json::Value) {
        let name = FileName::new(MEMORY_SCHEME, path);
        if let Some(node) = self.tree.nodes.write().get_mut(name.path()) {
            node.attributes.insert(attr.to_string(), value);
        }
    }

    /// Take the whole tree offline (or back online). While offline every
    /// resolution fails.
    pub fn set_offline(&self, offline: bool) {
        self.tree.offline.store(offline, Ordering::SeqCst);
    }

    /// Paths of every file (not folder), sorted.
    pub fn file_paths(&self) -> Vec<String> {
        self.tree
            .nodes
            .read()
            .iter()
            .filter(|(_, node)| matches!(node.kind, NodeKind::File(_)))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Get a file object for a path.
    pub fn file(&self, path: &str) -> Arc<MemoryFile> {
        Arc::new(MemoryFile::new(
            self.tree.clone(),
            FileName::new(MEMORY_SCHEME, path),
        ))
    }
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    async fn resolve(&self, uri: &str) -> Result<Arc<dyn FileObject>> {
        if self.tree.offline.load(Ordering::SeqCst) {
            return Err(VfsError::Resolve {
                uri: uri.to_string(),
                reason: "backend offline".to_string(),
            });
        }
        let path = match split_scheme(uri) {
            Some((MEMORY_SCHEME, rest)) => rest,
            Some((scheme, _)) => return Err(VfsError::UnknownScheme(scheme.to_string())),
            None => uri,
        };
        let file: Arc<dyn FileObject> = self.file(path);
        Ok(file)
    }
}

/// A file or folder in a [`MemoryFileSystem`].
pub struct MemoryFile {
    tree: Arc<MemoryTree>,
    name: FileName,
    content: FileContent,
}

impl MemoryFile {
    fn new(tree: Arc<MemoryTree>, name: FileName) -> Self {
        let provider = Arc::new(MemoryContent {
            tree: tree.clone(),
            name: name.clone(),
            pending: Mutex::new(None),
        });
        Self {
            tree,
            name,
            content: FileContent::new(provider),
        }
    }
}

#[async_trait]
impl FileObject for MemoryFile {
    fn name(&self) -> &FileName {
        &self.name
    }

    fn content(&self) -> &FileContent {
        &self.content
    }

    async fn file_type(&self) -> Result<FileType> {
        Ok(self.tree.file_type(self.name.path()))
    }

    async fn is_readable(&self) -> Result<bool> {
        Ok(self
            .tree
            .nodes
            .read()
            .get(self.name.path())
            .is_some_and(|node| node.readable))
    }

    async fn children(&self) -> Result<Vec<Arc<dyn FileObject>>> {
        if self.tree.file_type(self.name.path()) != FileType::Folder {
            return Ok(Vec::new());
        }

        let children: Vec<FileName> = self
            .tree
            .nodes
            .read()
            .keys()
            .filter(|path| path.as_str() != "/")
            .map(|path| FileName::new(MEMORY_SCHEME, path.as_str()))
            .filter(|name| name.parent().as_ref() == Some(&self.name))
            .collect();

        Ok(children
            .into_iter()
            .map(|name| Arc::new(MemoryFile::new(self.tree.clone(), name)) as Arc<dyn FileObject>)
            .collect())
    }

    async fn resolve_child(&self, name: &str) -> Result<Arc<dyn FileObject>> {
        let child: Arc<dyn FileObject> =
            Arc::new(MemoryFile::new(self.tree.clone(), self.name.child(name)));
        Ok(child)
    }

    async fn parent(&self) -> Result<Option<Arc<dyn FileObject>>> {
        Ok(self.name.parent().map(|parent| {
            Arc::new(MemoryFile::new(self.tree.clone(), parent)) as Arc<dyn FileObject>
        }))
    }

    async fn create_exclusive(&self, bytes: &[u8]) -> Result<bool> {
        self.tree.ensure_online(&self.name)?;
        let mut nodes = self.tree.nodes.write();
        if nodes.contains_key(self.name.path()) {
            return Ok(false);
        }
        MemoryTree::ensure_folders(&mut nodes, &self.name);
        nodes.insert(
            self.name.path().to_string(),
            MemoryNode::file(bytes.to_vec()),
        );
        Ok(true)
    }

    async fn move_to(&self, dest: &dyn FileObject) -> Result<()> {
        match self.tree.file_type(self.name.path()) {
            FileType::File => {}
            FileType::Imaginary => return Err(VfsError::NotFound(self.name.uri())),
            FileType::Folder => {
                return Err(VfsError::unsupported("moving a folder", &self.name.uri()));
            }
        }
        debug!("Moving {} to {}", self.name, dest.name());
        copy_content(self, dest)?;
        self.delete().await?;
        Ok(())
    }

    async fn delete(&self) -> Result<bool> {
        let mut nodes = self.tree.nodes.write();
        let prefix = format!("{}/", self.name.path());
        if nodes.keys().any(|path| path.starts_with(&prefix)) {
            return Err(VfsError::invalid_state(&self.name.uri(), "folder is not empty"));
        }
        Ok(nodes.remove(self.name.path()).is_some())
    }
}

struct MemoryContent {
    tree: Arc<MemoryTree>,
    name: FileName,
    pending: Mutex<Option<Arc<Mutex<Vec<u8>>>>>,
}

impl MemoryContent {
    fn node<T>(&self, f: impl FnOnce(&MemoryNode) -> T) -> Result<T> {
        self.tree
            .nodes
            .read()
            .get(self.name.path())
            .map(f)
            .ok_or_else(|| VfsError::NotFound(self.name.uri()))
    }

    fn pending_write(&self, initial: Vec<u8>) -> Result<Box<dyn Write + Send>> {
        let buffer = Arc::new(Mutex::new(initial));
        *self.pending.lock() = Some(buffer.clone());
        Ok(Box::new(PendingWrite { buffer }))
    }
}

impl ContentProvider for MemoryContent {
    fn uri(&self) -> String {
        self.name.uri()
    }

    fn file_type(&self) -> Result<FileType> {
        Ok(self.tree.file_type(self.name.path()))
    }

    fn content_size(&self) -> Result<u64> {
        self.node(|node| match &node.kind {
            NodeKind::File(bytes) => bytes.len() as u64,
            NodeKind::Folder => 0,
        })
    }

    fn last_modified(&self) -> Result<DateTime<Utc>> {
        self.node(|node| node.modified)
    }

    fn set_last_modified(&self, time: DateTime<Utc>) -> Result<()> {
        match self.tree.nodes.write().get_mut(self.name.path()) {
            Some(node) => {
                node.modified = time;
                Ok(())
            }
            None => Err(VfsError::NotFound(self.name.uri())),
        }
    }

    fn attributes(&self) -> Result<Attributes> {
        self.node(|node| node.attributes.clone())
    }

    fn set_attribute(&self, name: &str, value: serde_json::Value) -> Result<()> {
        match self.tree.nodes.write().get_mut(self.name.path()) {
            Some(node) => {
                node.attributes.insert(name.to_string(), value);
                Ok(())
            }
            None => Err(VfsError::NotFound(self.name.uri())),
        }
    }

    fn remove_attribute(&self, name: &str) -> Result<()> {
        match self.tree.nodes.write().get_mut(self.name.path()) {
            Some(node) => {
                node.attributes.remove(name);
                Ok(())
            }
            None => Err(VfsError::NotFound(self.name.uri())),
        }
    }

    fn input_stream(&self) -> Result<Box<dyn Read + Send>> {
        let bytes = self.node(|node| match &node.kind {
            NodeKind::File(bytes) => Some(bytes.clone()),
            NodeKind::Folder => None,
        })?;
        match bytes {
            Some(bytes) => Ok(Box::new(Cursor::new(bytes))),
            None => Err(VfsError::invalid_state(&self.name.uri(), "folder has no content")),
        }
    }

    fn output_stream(&self) -> Result<Box<dyn Write + Send>> {
        if self.tree.file_type(self.name.path()) == FileType::Folder {
            return Err(VfsError::invalid_state(&self.name.uri(), "folder has no content"));
        }
        self.pending_write(Vec::new())
    }

    fn append_stream(&self) -> Result<Box<dyn Write + Send>> {
        let existing = self.node(|node| match &node.kind {
            NodeKind::File(bytes) => Some(bytes.clone()),
            NodeKind::Folder => None,
        });
        match existing {
            Ok(Some(bytes)) => self.pending_write(bytes),
            Ok(None) => Err(VfsError::invalid_state(&self.name.uri(), "folder has no content")),
            Err(_) => self.pending_write(Vec::new()),
        }
    }

    fn end_output(&self) -> Result<()> {
        if let Some(buffer) = self.pending.lock().take() {
            let bytes = std::mem::take(&mut *buffer.lock());
            self.tree.put_file(self.name.path(), bytes);
        }
        Ok(())
    }
}

struct PendingWrite {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for PendingWrite {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
