//! Disposal of processed files.

use std::fmt::Write as _;
use std::sync::Arc;

use filepoll_vfs::{FileObject, FileSystem, VfsError, mask_uri_password};
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::{Action, PollEntry};
use crate::metrics::TransportMetrics;
use crate::outcome::Outcome;

/// What happened to a file after processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposal {
    /// The outcome calls for no action.
    Skipped,

    /// The file was moved to the given URI.
    Moved(String),

    /// The file was deleted.
    Deleted,

    /// The file was already gone when it was to be deleted.
    AlreadyGone,

    /// Disposal failed. The failure has been logged and counted.
    Failed,
}

/// Applies an entry's move-or-delete policy to processed files.
pub struct PostProcessor {
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    metrics: Arc<TransportMetrics>,
}

impl PostProcessor {
    /// Create a post processor resolving destinations through `fs`.
    pub fn new(
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        metrics: Arc<TransportMetrics>,
    ) -> Self {
        Self { fs, clock, metrics }
    }

    /// Dispose of `file` according to `entry` and the file's outcome.
    /// Errors are logged and counted, never returned.
    pub async fn apply(
        &self,
        entry: &PollEntry,
        file: &dyn FileObject,
        outcome: Outcome,
    ) -> Disposal {
        let Some(action) = entry.action_for(outcome) else {
            return Disposal::Skipped;
        };

        let result = match action {
            Action::Delete => self.delete(file).await,
            Action::Move {
                destination,
                timestamp_format,
            } => {
                self.move_file(file, destination, timestamp_format.as_deref())
                    .await
            }
        };

        match result {
            Ok(disposal) => disposal,
            Err(e) => {
                self.metrics.record_disposal_failure();
                match action {
                    Action::Delete => error!("Error deleting {}: {}", file.name(), e),
                    Action::Move { destination, .. } => error!(
                        "Error moving {} to {}: {}",
                        file.name(),
                        mask_uri_password(destination),
                        e
                    ),
                }
                Disposal::Failed
            }
        }
    }

    async fn delete(&self, file: &dyn FileObject) -> Result<Disposal, VfsError> {
        debug!("Deleting {}", file.name());
        if let Err(e) = file.close().await {
            warn!("Error closing {} before delete: {}", file.name(), e);
        }

        match file.delete().await {
            Ok(true) => Ok(Disposal::Deleted),
            Ok(false) => {
                debug!("{} was already removed", file.name());
                Ok(Disposal::AlreadyGone)
            }
            Err(e) if e.is_not_found() => {
                debug!("{} was already removed", file.name());
                Ok(Disposal::AlreadyGone)
            }
            Err(e) => Err(e),
        }
    }

    async fn move_file(
        &self,
        file: &dyn FileObject,
        destination: &str,
        timestamp_format: Option<&str>,
    ) -> Result<Disposal, VfsError> {
        let folder = self.fs.resolve(destination).await?;

        let mut target = String::new();
        if let Some(format) = timestamp_format {
            write!(target, "{}", self.clock.now().format(format)).map_err(|_| {
                VfsError::invalid_state(
                    &file.name().uri(),
                    format!("invalid timestamp format {format}"),
                )
            })?;
        }
        target.push_str(file.name().base_name());

        let dest = folder.resolve_child(&target).await?;
        debug!("Moving {} to {}", file.name(), mask_uri_password(&dest.name().uri()));

        if let Err(e) = file.close().await {
            warn!("Error closing {} before move: {}", file.name(), e);
        }
        file.move_to(dest.as_ref()).await?;
        Ok(Disposal::Moved(dest.name().uri()))
    }
}

impl std::fmt::Debug for PostProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostProcessor").finish_non_exhaustive()
    }
}
