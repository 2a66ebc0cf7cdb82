//! Advisory claims on files.
//!
//! A claim has two halves. Within one process a claim table, checked and
//! updated under a single mutex, keeps a coordinator from claiming the same
//! file twice. Across coordinators and processes a `<name>.lock` sibling is
//! created exclusively through the file's own backend: whoever creates it
//! holds the claim. Both are cooperative: a consumer that does not use a
//! coordinator is not stopped.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;

use filepoll_vfs::{FileObject, VfsError, mask_uri_password};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Suffix of lock artifacts written next to claimed files.
pub const LOCK_SUFFIX: &str = ".lock";

/// Base name of the lock artifact for `base_name`.
pub fn lock_name(base_name: &str) -> String {
    format!("{base_name}{LOCK_SUFFIX}")
}

/// Whether `base_name` is the lock artifact of one of `siblings`.
pub fn is_lock_artifact(base_name: &str, siblings: &HashSet<&str>) -> bool {
    base_name
        .strip_suffix(LOCK_SUFFIX)
        .is_some_and(|target| siblings.contains(target))
}

/// Claims and releases files on behalf of one consumer.
#[derive(Default)]
pub struct LockCoordinator {
    /// Claimed URIs and the token written for each.
    claims: Mutex<HashMap<String, String>>,
}

impl LockCoordinator {
    /// Create a coordinator with no claims.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this coordinator currently holds a claim on `uri`.
    pub fn is_held(&self, uri: &str) -> bool {
        self.claims.lock().contains_key(uri)
    }

    /// Number of claims currently held.
    pub fn held_count(&self) -> usize {
        self.claims.lock().len()
    }

    /// Try to claim `file`. Returns `false` when it is claimed elsewhere or
    /// anything goes wrong while claiming.
    pub async fn acquire(&self, file: &dyn FileObject) -> bool {
        let uri = file.name().uri();
        let token = Uuid::new_v4().to_string();

        {
            let mut claims = self.claims.lock();
            if claims.contains_key(&uri) {
                debug!("{} is already claimed by this process", mask_uri_password(&uri));
                return false;
            }
            claims.insert(uri.clone(), token.clone());
        }

        match create_lock_file(file, &token).await {
            Ok(true) => {
                debug!("Claimed {}", mask_uri_password(&uri));
                true
            }
            Ok(false) => {
                debug!("{} is claimed by another consumer", mask_uri_password(&uri));
                self.claims.lock().remove(&uri);
                false
            }
            Err(e) => {
                debug!("Cannot claim {}: {}", mask_uri_password(&uri), e);
                self.claims.lock().remove(&uri);
                false
            }
        }
    }

    /// Give up the claim on `file`. Does nothing for files this coordinator
    /// never claimed, and never fails.
    pub async fn release(&self, file: &dyn FileObject) {
        let uri = file.name().uri();
        let Some(token) = self.claims.lock().remove(&uri) else {
            return;
        };

        if let Err(e) = remove_lock_file(file, &token).await {
            if e.is_not_found() {
                debug!("Lock file for {} is already gone", mask_uri_password(&uri));
            } else {
                warn!("Cannot remove lock file for {}: {}", mask_uri_password(&uri), e);
            }
        }
    }
}

impl std::fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("held", &self.held_count())
            .finish()
    }
}

/// The lock sibling of `file`, resolved by name within its folder.
async fn lock_file(file: &dyn FileObject) -> Result<Arc<dyn FileObject>, VfsError> {
    let parent = file
        .parent()
        .await?
        .ok_or_else(|| VfsError::invalid_state(&file.name().uri(), "the root has no siblings"))?;
    parent.resolve_child(&lock_name(file.name().base_name())).await
}

async fn create_lock_file(file: &dyn FileObject, token: &str) -> Result<bool, VfsError> {
    lock_file(file).await?.create_exclusive(token.as_bytes()).await
}

async fn remove_lock_file(file: &dyn FileObject, token: &str) -> Result<(), VfsError> {
    let lock = lock_file(file).await?;
    if !lock.exists().await? {
        return Err(VfsError::NotFound(lock.name().uri()));
    }

    let found = read_token(lock.as_ref())?;
    if found != token {
        warn!(
            "Lock file {} was taken over, leaving it in place",
            mask_uri_password(&lock.name().uri())
        );
        return Ok(());
    }

    lock.delete().await?;
    Ok(())
}

fn read_token(lock: &dyn FileObject) -> Result<String, VfsError> {
    let mut token = String::new();
    let mut reader = lock.content().open_read()?;
    reader.read_to_string(&mut token)?;
    reader.close();
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filepoll_vfs::{LocalFileSystem, MemoryFileSystem};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tokio::sync::Barrier;

    #[tokio::test]
    async fn test_second_acquire_is_refused() {
        let fs = MemoryFileSystem::new();
        fs.write_file("/in/a.xml", "<a/>");
        let locks = LockCoordinator::new();
        let file = fs.file("/in/a.xml");

        assert!(locks.acquire(file.as_ref()).await);
        assert!(!locks.acquire(file.as_ref()).await);
        assert!(fs.exists("/in/a.xml.lock"));
        assert!(locks.is_held("mem:///in/a.xml"));
    }

    #[tokio::test]
    async fn test_release_allows_reacquire() {
        let fs = MemoryFileSystem::new();
        fs.write_file("/in/a.xml", "<a/>");
        let locks = LockCoordinator::new();
        let file = fs.file("/in/a.xml");

        assert!(locks.acquire(file.as_ref()).await);
        locks.release(file.as_ref()).await;

        assert!(!fs.exists("/in/a.xml.lock"));
        assert_eq!(locks.held_count(), 0);
        assert!(locks.acquire(file.as_ref()).await);
    }

    #[tokio::test]
    async fn test_lock_file_from_another_consumer_blocks() {
        let fs = MemoryFileSystem::new();
        fs.write_file("/in/a.xml", "<a/>");
        let first = LockCoordinator::new();
        let second = LockCoordinator::new();
        let file = fs.file("/in/a.xml");

        assert!(first.acquire(file.as_ref()).await);
        assert!(!second.acquire(file.as_ref()).await);

        // Releasing a claim the second coordinator never made leaves the
        // first one's lock file alone.
        second.release(file.as_ref()).await;
        assert!(fs.exists("/in/a.xml.lock"));
    }

    #[tokio::test]
    async fn test_release_unclaimed_is_noop() {
        let fs = MemoryFileSystem::new();
        let locks = LockCoordinator::new();
        locks.release(fs.file("/in/missing.xml").as_ref()).await;
        assert_eq!(locks.held_count(), 0);
    }

    #[tokio::test]
    async fn test_release_after_file_and_lock_vanish() {
        let fs = MemoryFileSystem::new();
        fs.write_file("/in/a.xml", "<a/>");
        let locks = LockCoordinator::new();
        let file = fs.file("/in/a.xml");

        assert!(locks.acquire(file.as_ref()).await);
        fs.remove("/in/a.xml");
        fs.remove("/in/a.xml.lock");

        locks.release(file.as_ref()).await;
        assert_eq!(locks.held_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_fails_quietly_when_offline() {
        let fs = MemoryFileSystem::new();
        fs.write_file("/in/a.xml", "<a/>");
        let locks = LockCoordinator::new();
        let file = fs.file("/in/a.xml");

        fs.set_offline(true);
        assert!(!locks.acquire(file.as_ref()).await);
        assert_eq!(locks.held_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let fs = MemoryFileSystem::new();
        fs.write_file("/in/a.xml", "<a/>");
        let locks = Arc::new(LockCoordinator::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let file = fs.file("/in/a.xml");
            handles.push(tokio::spawn(async move { locks.acquire(file.as_ref()).await }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_lock_artifact_names() {
        let siblings = HashSet::from(["a.xml", "a.xml.lock", "yarn.lock"]);
        assert!(is_lock_artifact("a.xml.lock", &siblings));
        assert!(!is_lock_artifact("a.xml", &siblings));
        assert!(!is_lock_artifact("yarn.lock", &siblings));
        assert_eq!(lock_name("a.xml"), "a.xml.lock");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_separate_coordinators_on_local_disk_have_one_winner() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();

        for trial in 0..200 {
            let path = temp_dir.path().join(format!("file-{trial}.xml"));
            std::fs::write(&path, "<a/>").unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let mut handles = Vec::new();
            for _ in 0..2 {
                let barrier = barrier.clone();
                let file = fs.file(&path).unwrap();
                handles.push(tokio::spawn(async move {
                    let locks = LockCoordinator::new();
                    barrier.wait().await;
                    locks.acquire(file.as_ref()).await
                }));
            }

            let mut winners = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1, "trial {trial}");
        }
    }

    #[tokio::test]
    async fn test_lock_file_named_after_base_name() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("order?id=7.xml");
        std::fs::write(&path, "<order/>").unwrap();
        let file = LocalFileSystem::new().file(&path).unwrap();
        let locks = LockCoordinator::new();

        assert!(locks.acquire(file.as_ref()).await);
        assert!(temp_dir.path().join("order?id=7.xml.lock").exists());
        assert!(!temp_dir.path().join("order").exists());

        locks.release(file.as_ref()).await;
        assert!(!temp_dir.path().join("order?id=7.xml.lock").exists());
    }
}
