//! One poll cycle for one entry.
//!
//! ```text
//! resolve (retry) ──► list candidates ──► for each file:
//!                                           acquire ─► build ─► dispatch
//!                                              │                   │
//!                                              │       dispose ◄───┘
//!                                              └──────► release
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use filepoll_vfs::{FileObject, FileSystem, FileType, mask_uri_password};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::builder::{BuilderSelector, ContentType};
use crate::clock::{Clock, SystemClock};
use crate::config::PollEntry;
use crate::dispatch::{DispatchRequest, MessageEngine, ReplyTo, TransportHeaders};
use crate::error::{BuildError, PollError, Result};
use crate::lock::{LockCoordinator, is_lock_artifact};
use crate::metrics::TransportMetrics;
use crate::outcome::{BatchOutcome, Outcome};
use crate::post::PostProcessor;

/// Attribute some backends use to report a file's media type.
pub const CONTENT_TYPE_ATTRIBUTE: &str = "contentType";

/// Drives poll cycles against one file system and one engine.
pub struct Scanner {
    fs: Arc<dyn FileSystem>,
    engine: Arc<dyn MessageEngine>,
    builders: Arc<BuilderSelector>,
    locks: Arc<LockCoordinator>,
    clock: Arc<dyn Clock>,
    metrics: Arc<TransportMetrics>,
    post: PostProcessor,
}

impl Scanner {
    /// Create a scanner with the default builders, the system clock and
    /// fresh metrics.
    pub fn new(fs: Arc<dyn FileSystem>, engine: Arc<dyn MessageEngine>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let metrics = Arc::new(TransportMetrics::new());
        Self {
            locks: Arc::new(LockCoordinator::new()),
            post: PostProcessor::new(fs.clone(), clock.clone(), metrics.clone()),
            builders: Arc::new(BuilderSelector::default()),
            fs,
            engine,
            clock,
            metrics,
        }
    }

    /// Use a custom builder table.
    pub fn with_builders(mut self, builders: BuilderSelector) -> Self {
        self.builders = Arc::new(builders);
        self
    }

    /// Use a custom clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self.rebuild_post();
        self
    }

    /// Record into shared metrics.
    pub fn with_metrics(mut self, metrics: Arc<TransportMetrics>) -> Self {
        self.metrics = metrics;
        self.rebuild_post();
        self
    }

    /// Share claims with other scanners in this process.
    pub fn with_lock_coordinator(mut self, locks: Arc<LockCoordinator>) -> Self {
        self.locks = locks;
        self
    }

    fn rebuild_post(&mut self) {
        self.post = PostProcessor::new(self.fs.clone(), self.clock.clone(), self.metrics.clone());
    }

    /// Counters kept by this scanner.
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    /// The clock used for poll bookkeeping.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The lock coordinator used by this scanner.
    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    /// Run one cycle for `entry`.
    ///
    /// Returns the batch outcome. Poll state is updated only when at least
    /// one file was processed. When the location cannot be resolved within
    /// the retry bound the cycle is abandoned with
    /// [`PollError::FatalEntryFailure`].
    pub async fn poll(&self, entry: &mut PollEntry) -> Result<Outcome> {
        let uri = mask_uri_password(entry.file_uri());
        debug!("Polling {}", uri);

        let location = match self.resolve_with_retry(entry).await {
            Ok(location) => location,
            Err(e) => {
                self.metrics.record_fatal();
                error!(failure = "entry", "Giving up on {}: {}", uri, e);
                return Err(e);
            }
        };

        match self.is_accessible(location.as_ref()).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Cannot access or read {}", uri);
                return Ok(Outcome::None);
            }
            Err(e) => {
                error!(failure = "entry", "Error checking {}: {}", uri, e);
                return Err(e.into());
            }
        }

        let candidates = match self.candidates(entry, location).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(failure = "entry", "Error listing {}: {}", uri, e);
                return Err(e);
            }
        };

        let mut batch = BatchOutcome::new();
        for file in candidates {
            if let Some(outcome) = self.process_candidate(entry, file).await {
                batch.record(outcome);
            }
        }

        let outcome = batch.outcome();
        if outcome == Outcome::None {
            debug!("Nothing to process in {}", uri);
        } else {
            entry.record_poll(outcome, self.clock.now());
            info!(
                "Polled {}: {} succeeded, {} failed ({:?})",
                uri,
                batch.succeeded(),
                batch.failed(),
                outcome
            );
        }
        Ok(outcome)
    }

    async fn resolve_with_retry(&self, entry: &PollEntry) -> Result<Arc<dyn FileObject>> {
        let attempts = entry.max_retry_count();
        let mut attempt = 1;
        loop {
            match self.fs.resolve(entry.file_uri()).await {
                Ok(location) => return Ok(location),
                Err(e) if attempt >= attempts => {
                    return Err(PollError::FatalEntryFailure {
                        uri: mask_uri_password(entry.file_uri()),
                        attempts,
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(
                        "Cannot resolve {} (attempt {}/{}): {}, retrying in {:?}",
                        mask_uri_password(entry.file_uri()),
                        attempt,
                        attempts,
                        e,
                        entry.reconnect_timeout()
                    );
                    tokio::time::sleep(entry.reconnect_timeout()).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn is_accessible(&self, location: &dyn FileObject) -> filepoll_vfs::Result<bool> {
        Ok(location.exists().await? && location.is_readable().await?)
    }

    async fn candidates(
        &self,
        entry: &PollEntry,
        location: Arc<dyn FileObject>,
    ) -> Result<Vec<Arc<dyn FileObject>>> {
        if location.file_type().await? != FileType::Folder {
            return Ok(vec![location]);
        }

        let children = location.children().await?;
        let names: HashSet<&str> = children.iter().map(|c| c.name().base_name()).collect();
        let locking = entry.locking_enabled();

        let mut files = Vec::new();
        for child in &children {
            let base_name = child.name().base_name();
            if (locking && is_lock_artifact(base_name, &names)) || !entry.matches(base_name) {
                continue;
            }
            match child.file_type().await {
                Ok(FileType::File) => files.push(child.clone()),
                Ok(_) => {}
                Err(e) => debug!("Skipping {}: {}", child.name(), e),
            }
        }
        Ok(files)
    }

    /// Claim, process, dispose of and release one file. Returns `None` when
    /// the file could not be claimed.
    async fn process_candidate(
        &self,
        entry: &PollEntry,
        file: Arc<dyn FileObject>,
    ) -> Option<Outcome> {
        let locking = entry.locking_enabled();
        if locking && !self.locks.acquire(file.as_ref()).await {
            debug!("Skipping {}, it is claimed elsewhere", file.name());
            return None;
        }

        let outcome = match self.process_file(entry, &file).await {
            Ok(()) => Outcome::Success,
            Err(e) => {
                self.metrics.record_fault();
                warn!(failure = "file", "Failed to process {}: {}", file.name(), e);
                Outcome::Failed
            }
        };

        if let Err(e) = file.close().await {
            debug!("Error closing {}: {}", file.name(), e);
        }
        self.post.apply(entry, file.as_ref(), outcome).await;

        if locking {
            self.locks.release(file.as_ref()).await;
        }
        Some(outcome)
    }

    async fn process_file(&self, entry: &PollEntry, file: &Arc<dyn FileObject>) -> Result<()> {
        let work = self.build_and_dispatch(entry, file.clone());
        match entry.dispatch_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, work)
                .await
                .map_err(|_| PollError::DispatchTimeout {
                    uri: file.name().uri(),
                    timeout,
                })?,
            None => work.await,
        }
    }

    async fn build_and_dispatch(
        &self,
        entry: &PollEntry,
        file: Arc<dyn FileObject>,
    ) -> Result<()> {
        let uri = file.name().uri();
        let content_type = self.content_type_for(entry, file.as_ref());
        let headers = TransportHeaders::for_file(file.as_ref());
        let length = file.content().size().ok();

        let builder = self.builders.select(content_type.as_ref());
        let source = self
            .builders
            .source_for(builder.as_ref(), &file, entry.streaming())
            .map_err(|e| PollError::Build {
                uri: uri.clone(),
                source: e.into(),
            })?;

        debug!("Building {} with the {} builder", uri, builder.name());
        let build_type = content_type.clone();
        let built =
            tokio::task::spawn_blocking(move || builder.build(source, build_type.as_ref())).await;
        let message = built
            .map_err(|e| PollError::Build {
                uri: uri.clone(),
                source: BuildError::Interrupted(e.to_string()),
            })?
            .map_err(|source| PollError::Build {
                uri: uri.clone(),
                source,
            })?;

        let request = DispatchRequest {
            message,
            headers,
            content_type,
            reply_to: entry.reply_file_uri().map(|reply| ReplyTo {
                uri: reply.to_string(),
                locking: entry.locking_enabled(),
            }),
        };
        self.engine
            .dispatch(request)
            .await
            .map_err(|source| PollError::Dispatch {
                uri: uri.clone(),
                source,
            })?;

        self.metrics.record_received(length);
        debug!("Dispatched {}", uri);
        Ok(())
    }

    /// Declared type, then the extension, then the backend's attribute.
    fn content_type_for(&self, entry: &PollEntry, file: &dyn FileObject) -> Option<ContentType> {
        if let Some(declared) = entry.content_type() {
            return Some(ContentType::parse(declared));
        }
        if let Some(inferred) = file.name().extension().and_then(ContentType::from_extension) {
            return Some(inferred);
        }
        match file.content().attribute(CONTENT_TYPE_ATTRIBUTE) {
            Ok(Some(Value::String(declared))) => Some(ContentType::parse(&declared)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("builders", &self.builders)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntryConfig;
    use crate::dispatch::ChannelEngine;
    use filepoll_vfs::MemoryFileSystem;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_content_type_resolution_order() {
        let fs = MemoryFileSystem::new();
        fs.write_file("/in/a.xml", "<a/>");
        fs.write_file("/in/b.qqq", "b");
        fs.set_attribute("/in/b.qqq", CONTENT_TYPE_ATTRIBUTE, Value::from("text/plain"));
        fs.write_file("/in/c", "c");
        let (engine, _rx) = ChannelEngine::new(1);
        let scanner = Scanner::new(Arc::new(fs.clone()), Arc::new(engine));

        let declared = PollEntry::new(
            EntryConfig::new("mem:///in").with_content_type("text/plain; charset=UTF-8"),
        )
        .unwrap();
        let inferred = PollEntry::new(EntryConfig::new("mem:///in")).unwrap();

        let a = fs.file("/in/a.xml");
        let b = fs.file("/in/b.qqq");
        let c = fs.file("/in/c");

        assert_eq!(
            scanner.content_type_for(&declared, a.as_ref()),
            Some(ContentType::parse("text/plain; charset=UTF-8"))
        );
        assert_eq!(
            scanner.content_type_for(&inferred, a.as_ref()),
            Some(ContentType::new("text/xml"))
        );
        assert_eq!(
            scanner.content_type_for(&inferred, b.as_ref()),
            Some(ContentType::new("text/plain"))
        );
        assert_eq!(scanner.content_type_for(&inferred, c.as_ref()), None);

        let blank = PollEntry::new(EntryConfig::new("mem:///in").with_content_type("  ")).unwrap();
        assert_eq!(
            scanner.content_type_for(&blank, a.as_ref()),
            Some(ContentType::new("text/xml"))
        );
    }
}
