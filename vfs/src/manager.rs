//! Scheme based dispatch across file system backends.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{Result, VfsError};
use crate::local::{LOCAL_SCHEME, LocalFileSystem};
use crate::name::{mask_uri_password, split_scheme};
use crate::object::{FileObject, FileSystem};

/// Routes each URI to the backend registered for its scheme.
///
/// URIs without a scheme go to the default scheme, `file` unless changed.
pub struct FileSystemManager {
    backends: HashMap<String, Arc<dyn FileSystem>>,
    default_scheme: String,
}

impl FileSystemManager {
    /// Create a manager with no backends.
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_scheme: LOCAL_SCHEME.to_string(),
        }
    }

    /// Create a manager with the local disk backend registered.
    pub fn with_local() -> Self {
        Self::new().with_backend(LOCAL_SCHEME, Arc::new(LocalFileSystem::new()))
    }

    /// Register a backend for a scheme, replacing any previous one.
    pub fn with_backend(mut self, scheme: impl Into<String>, fs: Arc<dyn FileSystem>) -> Self {
        self.register(scheme, fs);
        self
    }

    /// Set the scheme used for URIs that have none.
    pub fn with_default_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.default_scheme = scheme.into();
        self
    }

    /// Register a backend for a scheme, replacing any previous one.
    pub fn register(&mut self, scheme: impl Into<String>, fs: Arc<dyn FileSystem>) {
        let scheme = scheme.into();
        info!("Registered file system backend for scheme: {scheme}");
        self.backends.insert(scheme, fs);
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }
}

impl Default for FileSystemManager {
    fn default() -> Self {
        Self::with_local()
    }
}

#[async_trait]
impl FileSystem for FileSystemManager {
    async fn resolve(&self, uri: &str) -> Result<Arc<dyn FileObject>> {
        let scheme = split_scheme(uri).map_or(self.default_scheme.as_str(), |(s, _)| s);
        let backend = self
            .backends
            .get(scheme)
            .ok_or_else(|| VfsError::UnknownScheme(scheme.to_string()))?;
        debug!("Resolving {}", mask_uri_password(uri));
        backend.resolve(uri).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MEMORY_SCHEME, MemoryFileSystem};
    use crate::name::FileType;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_dispatch_by_scheme() {
        let memory = MemoryFileSystem::new();
        memory.write_file("/in/a.xml", "<a/>");

        let manager =
            FileSystemManager::with_local().with_backend(MEMORY_SCHEME, Arc::new(memory));
        assert_eq!(manager.schemes(), vec!["file", "mem"]);

        let file = tokio_test::assert_ok!(manager.resolve("mem:///in/a.xml").await);
        assert_eq!(file.file_type().await.unwrap(), FileType::File);
    }

    #[tokio::test]
    async fn test_unknown_scheme() {
        let manager = FileSystemManager::new();
        let result = manager.resolve("smb://host/share").await;
        assert!(matches!(result, Err(VfsError::UnknownScheme(s)) if s == "smb"));
    }

    #[tokio::test]
    async fn test_bare_path_uses_default_scheme() {
        let memory = MemoryFileSystem::new();
        memory.write_file("/in/a.xml", "<a/>");
        let manager = FileSystemManager::new()
            .with_backend(MEMORY_SCHEME, Arc::new(memory))
            .with_default_scheme(MEMORY_SCHEME);

        let file = manager.resolve("/in/a.xml").await.unwrap();
        assert_eq!(file.name().uri(), "mem:///in/a.xml");
    }
}
