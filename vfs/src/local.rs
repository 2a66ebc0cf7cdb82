//! Local disk backend for `file://` URIs and plain paths.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

use crate::content::FileContent;
use crate::error::{Result, VfsError};
use crate::name::{FileName, FileType, split_scheme};
use crate::object::{Attributes, ContentProvider, FileObject, FileSystem, copy_content};

/// URI scheme served by [`LocalFileSystem`].
pub const LOCAL_SCHEME: &str = "file";

/// File system over the local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    /// Create a new local file system.
    pub fn new() -> Self {
        Self
    }

    /// Get a file object for a path.
    pub fn file(&self, path: impl AsRef<Path>) -> Result<Arc<LocalFile>> {
        let path = std::path::absolute(path.as_ref())?;
        Ok(Arc::new(LocalFile::new(path)))
    }

    fn path_from_uri(uri: &str) -> Result<PathBuf> {
        match split_scheme(uri) {
            Some((LOCAL_SCHEME, _)) => {
                let url = Url::parse(uri).map_err(|e| VfsError::Resolve {
                    uri: uri.to_string(),
                    reason: e.to_string(),
                })?;
                url.to_file_path().map_err(|()| VfsError::Resolve {
                    uri: uri.to_string(),
                    reason: "not a local file path".to_string(),
                })
            }
            Some((scheme, _)) => Err(VfsError::UnknownScheme(scheme.to_string())),
            None => Ok(PathBuf::from(uri)),
        }
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn resolve(&self, uri: &str) -> Result<Arc<dyn FileObject>> {
        let path = Self::path_from_uri(uri)?;
        let file: Arc<dyn FileObject> = self.file(path)?;
        Ok(file)
    }
}

/// A file or directory on local disk.
pub struct LocalFile {
    name: FileName,
    path: PathBuf,
    content: FileContent,
}

impl LocalFile {
    fn new(path: PathBuf) -> Self {
        let name = FileName::new(LOCAL_SCHEME, path.to_string_lossy());
        let provider = Arc::new(LocalContent {
            uri: name.uri(),
            path: path.clone(),
        });
        Self {
            name,
            path,
            content: FileContent::new(provider),
        }
    }

    /// Path on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn file_type_of(path: &Path) -> Result<FileType> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(FileType::Folder),
        Ok(_) => Ok(FileType::File),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileType::Imaginary),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl FileObject for LocalFile {
    fn name(&self) -> &FileName {
        &self.name
    }

    fn content(&self) -> &FileContent {
        &self.content
    }

    async fn file_type(&self) -> Result<FileType> {
        match fs::metadata(&self.path).await {
            Ok(meta) if meta.is_dir() => Ok(FileType::Folder),
            Ok(_) => Ok(FileType::File),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileType::Imaginary),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_readable(&self) -> Result<bool> {
        Ok(match self.file_type().await? {
            FileType::File => fs::File::open(&self.path).await.is_ok(),
            FileType::Folder => fs::read_dir(&self.path).await.is_ok(),
            FileType::Imaginary => false,
        })
    }

    async fn children(&self) -> Result<Vec<Arc<dyn FileObject>>> {
        if self.file_type().await? != FileType::Folder {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        paths.sort();

        Ok(paths
            .into_iter()
            .map(|p| Arc::new(LocalFile::new(p)) as Arc<dyn FileObject>)
            .collect())
    }

    async fn resolve_child(&self, name: &str) -> Result<Arc<dyn FileObject>> {
        Ok(Arc::new(LocalFile::new(self.path.join(name))))
    }

    async fn parent(&self) -> Result<Option<Arc<dyn FileObject>>> {
        Ok(self
            .path
            .parent()
            .map(|parent| Arc::new(LocalFile::new(parent.to_path_buf())) as Arc<dyn FileObject>))
    }

    async fn create_exclusive(&self, bytes: &[u8]) -> Result<bool> {
        let opened = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await;
        let mut file = match opened {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(true)
    }

    async fn move_to(&self, dest: &dyn FileObject) -> Result<()> {
        if dest.name().scheme() != LOCAL_SCHEME {
            copy_content(self, dest)?;
            self.delete().await?;
            return Ok(());
        }

        let target = PathBuf::from(dest.name().path());
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        debug!("Renaming {} to {}", self.path.display(), target.display());
        fs::rename(&self.path, &target).await?;
        Ok(())
    }

    async fn delete(&self) -> Result<bool> {
        let removed = match self.file_type().await? {
            FileType::Imaginary => return Ok(false),
            FileType::Folder => fs::remove_dir(&self.path).await,
            FileType::File => fs::remove_file(&self.path).await,
        };
        match removed {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

struct LocalContent {
    uri: String,
    path: PathBuf,
}

impl ContentProvider for LocalContent {
    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn file_type(&self) -> Result<FileType> {
        file_type_of(&self.path)
    }

    fn content_size(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn last_modified(&self) -> Result<DateTime<Utc>> {
        let modified = std::fs::metadata(&self.path)?.modified()?;
        Ok(DateTime::<Utc>::from(modified))
    }

    fn set_last_modified(&self, time: DateTime<Utc>) -> Result<()> {
        let file = File::options().write(true).open(&self.path)?;
        file.set_modified(time.into())?;
        Ok(())
    }

    fn attributes(&self) -> Result<Attributes> {
        let meta = std::fs::metadata(&self.path)?;
        let mut attributes = Attributes::new();
        attributes.insert(
            "readonly".to_string(),
            serde_json::Value::Bool(meta.permissions().readonly()),
        );
        attributes.insert(
            "symlink".to_string(),
            serde_json::Value::Bool(self.path.is_symlink()),
        );
        Ok(attributes)
    }

    fn input_stream(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(BufReader::new(File::open(&self.path)?)))
    }

    fn output_stream(&self) -> Result<Box<dyn Write + Send>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Box::new(BufWriter::new(File::create(&self.path)?)))
    }

    fn append_stream(&self) -> Result<Box<dyn Write + Send>> {
        let file = File::options().append(true).create(true).open(&self.path)?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_resolve_file_uri_and_plain_path() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), "hello").unwrap();

        let fs = LocalFileSystem::new();
        let uri = Url::from_file_path(temp_dir.path().join("a.txt"))
            .unwrap()
            .to_string();
        let by_uri = fs.resolve(&uri).await.unwrap();
        let by_path = fs
            .resolve(&temp_dir.path().join("a.txt").to_string_lossy())
            .await
            .unwrap();

        assert_eq!(by_uri.name(), by_path.name());
        assert_eq!(by_uri.file_type().await.unwrap(), FileType::File);
        assert_eq!(by_uri.content().size().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_rejected() {
        let fs = LocalFileSystem::new();
        let result = fs.resolve("sftp://host/in").await;
        assert!(matches!(result, Err(VfsError::UnknownScheme(_))));
    }

    #[tokio::test]
    async fn test_children_are_sorted() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["c.xml", "a.xml", "b.xml"] {
            std::fs::write(temp_dir.path().join(name), "<a/>").unwrap();
        }

        let dir = LocalFileSystem::new().file(temp_dir.path()).unwrap();
        let names: Vec<String> = dir
            .children()
            .await
            .unwrap()
            .iter()
            .map(|c| c.name().base_name().to_string())
            .collect();

        assert_eq!(names, vec!["a.xml", "b.xml", "c.xml"]);
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let file = LocalFileSystem::new()
            .file(temp_dir.path().join("out/reply.txt"))
            .unwrap();

        let mut writer = file.content().open_write().unwrap();
        writer.write_all(b"reply").unwrap();
        writer.close().unwrap();

        let mut text = String::new();
        file.content()
            .open_read()
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "reply");
    }

    #[tokio::test]
    async fn test_append_to_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("log.txt"), "ab").unwrap();
        let file = LocalFileSystem::new()
            .file(temp_dir.path().join("log.txt"))
            .unwrap();

        let mut writer = file.content().open_write_append().unwrap();
        writer.write_all(b"cd").unwrap();
        writer.close().unwrap();

        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("log.txt")).unwrap(),
            "abcd"
        );
    }

    #[tokio::test]
    async fn test_create_exclusive_only_once() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();
        let first = fs.file(temp_dir.path().join("a.xml.lock")).unwrap();
        let second = fs.file(temp_dir.path().join("a.xml.lock")).unwrap();

        assert!(first.create_exclusive(b"one").await.unwrap());
        assert!(!second.create_exclusive(b"two").await.unwrap());
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("a.xml.lock")).unwrap(),
            "one"
        );
    }

    #[tokio::test]
    async fn test_parent_of_file() {
        let temp_dir = TempDir::new().unwrap();
        let file = LocalFileSystem::new()
            .file(temp_dir.path().join("a.xml"))
            .unwrap();

        let parent = file.parent().await.unwrap().unwrap();
        assert_eq!(parent.file_type().await.unwrap(), FileType::Folder);

        let root = LocalFileSystem::new().file("/").unwrap();
        assert!(root.parent().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_move_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("in.xml"), "<a/>").unwrap();

        let fs = LocalFileSystem::new();
        let src = fs.file(temp_dir.path().join("in.xml")).unwrap();
        let dest = fs.file(temp_dir.path().join("done/in.xml")).unwrap();

        src.move_to(&*dest).await.unwrap();
        assert!(!src.exists().await.unwrap());
        assert!(dest.exists().await.unwrap());

        assert!(dest.delete().await.unwrap());
        assert!(!dest.delete().await.unwrap());
    }
}
