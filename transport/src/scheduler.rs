//! Interval driver for poll entries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::{PollEntry, PollState, TransportConfig};
use crate::error::Result;
use crate::scanner::Scanner;

/// Status of one scheduled entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryStatus {
    /// Watched location.
    pub file_uri: String,

    /// Poll state as recorded by the scanner.
    pub state: PollState,

    /// When the scheduler will next poll the entry.
    pub due_at: Option<DateTime<Utc>>,

    /// Error from the most recent cycle, if it failed.
    pub last_error: Option<String>,

    /// Whether that error stopped the whole cycle.
    pub fatal: bool,

    /// Whether a cycle for the entry is running right now.
    pub polling: bool,
}

struct Slot {
    file_uri: String,

    /// Taken out while the entry is being polled.
    entry: Option<PollEntry>,

    /// State as of the last finished cycle.
    state: PollState,
    due_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    fatal: bool,
}

/// Polls entries whenever their interval has elapsed.
///
/// Entries are polled one after another on a single task. Several
/// schedulers may share one [`Scanner`]; its lock coordinator keeps them
/// from processing the same file twice.
pub struct PollScheduler {
    scanner: Arc<Scanner>,

    /// How often to check for due entries.
    tick: Duration,

    slots: Arc<Mutex<Vec<Slot>>>,

    /// Whether the scheduler is running.
    running: Arc<RwLock<bool>>,
}

impl PollScheduler {
    /// Create an empty scheduler.
    pub fn new(scanner: Arc<Scanner>, tick: Duration) -> Self {
        Self {
            scanner,
            tick,
            slots: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Create a scheduler for every entry in `config`.
    pub async fn from_config(
        scanner: Arc<Scanner>,
        config: &TransportConfig,
        tick: Duration,
    ) -> Result<Self> {
        let scheduler = Self::new(scanner, tick);
        for entry in config.build_entries()? {
            scheduler.add(entry).await;
        }
        Ok(scheduler)
    }

    /// Add an entry. It is due immediately.
    pub async fn add(&self, entry: PollEntry) {
        info!("Scheduling {}", filepoll_vfs::mask_uri_password(entry.file_uri()));
        self.slots.lock().await.push(Slot {
            file_uri: entry.file_uri().to_string(),
            state: entry.state().clone(),
            entry: Some(entry),
            due_at: None,
            last_error: None,
            fatal: false,
        });
    }

    /// Poll every entry that is due at the scanner's current time. Returns
    /// the number of entries polled.
    pub async fn run_due(&self) -> usize {
        Self::run_due_slots(&self.scanner, &self.slots).await
    }

    /// The slot table is locked only to take an entry out and to put it
    /// back, never across a cycle.
    async fn run_due_slots(scanner: &Scanner, slots: &Mutex<Vec<Slot>>) -> usize {
        let count = slots.lock().await.len();
        let mut polled = 0;

        for index in 0..count {
            let mut entry = {
                let mut slots = slots.lock().await;
                let Some(slot) = slots.get_mut(index) else {
                    break;
                };
                let now = scanner.clock().now();
                if slot.due_at.is_some_and(|due| due > now) {
                    continue;
                }
                // Already being polled by another round.
                let Some(entry) = slot.entry.take() else {
                    continue;
                };
                entry
            };

            let result = scanner.poll(&mut entry).await;

            let now = scanner.clock().now();
            let interval =
                chrono::Duration::from_std(entry.poll_interval()).unwrap_or(chrono::Duration::MAX);
            let mut slots = slots.lock().await;
            if let Some(slot) = slots.get_mut(index) {
                match result {
                    Ok(_) => {
                        slot.last_error = None;
                        slot.fatal = false;
                    }
                    Err(e) => {
                        slot.fatal = e.is_fatal();
                        slot.last_error = Some(e.to_string());
                    }
                }
                slot.state = entry.state().clone();
                slot.due_at = Some(now.checked_add_signed(interval).unwrap_or(now));
                slot.entry = Some(entry);
            }
            polled += 1;
        }

        polled
    }

    /// Start polling on a background task.
    pub async fn start(&self) {
        {
            let mut running = self.running.write().await;
            if *running {
                return;
            }
            *running = true;
        }

        let scanner = self.scanner.clone();
        let slots = self.slots.clone();
        let running = self.running.clone();
        let tick = self.tick;

        tokio::spawn(async move {
            while *running.read().await {
                let polled = Self::run_due_slots(&scanner, &slots).await;
                if polled > 0 {
                    debug!("Polled {} entries", polled);
                }
                tokio::time::sleep(tick).await;
            }
            debug!("Scheduler stopped");
        });
    }

    /// Stop after the current round.
    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    /// Whether the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Status of every entry.
    pub async fn entries(&self) -> Vec<EntryStatus> {
        self.slots
            .lock()
            .await
            .iter()
            .map(|slot| EntryStatus {
                file_uri: slot.file_uri.clone(),
                state: slot.state.clone(),
                due_at: slot.due_at,
                last_error: slot.last_error.clone(),
                fatal: slot.fatal,
                polling: slot.entry.is_none(),
            })
            .collect()
    }
}

impl std::fmt::Debug for PollScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollScheduler")
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::EntryConfig;
    use crate::dispatch::{ChannelEngine, DispatchRequest, FILE_NAME};
    use crate::outcome::Outcome;
    use chrono::TimeZone;
    use filepoll_vfs::MemoryFileSystem;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    fn scanner(
        fs: &MemoryFileSystem,
        clock: Arc<FixedClock>,
    ) -> (Arc<Scanner>, mpsc::Receiver<DispatchRequest>) {
        let (engine, rx) = ChannelEngine::new(16);
        let scanner = Scanner::new(Arc::new(fs.clone()), Arc::new(engine)).with_clock(clock);
        (Arc::new(scanner), rx)
    }

    #[tokio::test]
    async fn test_run_due_respects_interval() {
        let fs = MemoryFileSystem::new();
        fs.write_file("/in/a.xml", "<a/>");
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(start));
        let (scanner, mut rx) = scanner(&fs, clock.clone());

        let scheduler = PollScheduler::new(scanner, Duration::from_millis(10));
        let entry = PollEntry::new(
            EntryConfig::new("mem:///in").with_poll_interval(Duration::from_secs(60)),
        )
        .unwrap();
        scheduler.add(entry).await;

        assert_eq!(scheduler.run_due().await, 1);
        assert!(rx.recv().await.is_some());

        fs.write_file("/in/b.xml", "<b/>");
        assert_eq!(scheduler.run_due().await, 0);

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(scheduler.run_due().await, 1);

        let status = scheduler.entries().await;
        assert_eq!(status[0].state.last_poll_state, Outcome::Success);
        assert_eq!(status[0].last_error, None);
        assert_eq!(status[0].due_at, Some(start + chrono::Duration::seconds(121)));
    }

    #[tokio::test]
    async fn test_fatal_failure_is_reported() {
        let fs = MemoryFileSystem::new();
        fs.set_offline(true);
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let (scanner, _rx) = scanner(&fs, clock);

        let scheduler = PollScheduler::new(scanner, Duration::from_millis(10));
        let entry =
            PollEntry::new(EntryConfig::new("mem:///in").with_retry(1, Duration::ZERO)).unwrap();
        scheduler.add(entry).await;
        scheduler.run_due().await;

        let status = scheduler.entries().await;
        assert!(status[0].fatal);
        assert!(status[0].last_error.is_some());
        assert_eq!(status[0].state, PollState::default());
    }

    #[tokio::test]
    async fn test_status_readable_during_slow_cycle() {
        let fs = MemoryFileSystem::new();
        fs.set_offline(true);
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let (scanner, _rx) = scanner(&fs, clock);

        let scheduler = Arc::new(PollScheduler::new(scanner, Duration::from_millis(10)));
        let entry = PollEntry::new(
            EntryConfig::new("mem:///in").with_retry(3, Duration::from_millis(200)),
        )
        .unwrap();
        scheduler.add(entry).await;

        let background = scheduler.clone();
        let cycle = tokio::spawn(async move { background.run_due().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = tokio::time::timeout(Duration::from_millis(100), scheduler.entries())
            .await
            .unwrap();
        assert!(status[0].polling);
        assert_eq!(status[0].file_uri, "mem:///in");

        assert_eq!(cycle.await.unwrap(), 1);
        let status = scheduler.entries().await;
        assert!(!status[0].polling);
        assert!(status[0].fatal);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let fs = MemoryFileSystem::new();
        fs.write_file("/in/a.xml", "<a/>");
        let (engine, mut rx) = ChannelEngine::new(16);
        let scanner = Arc::new(Scanner::new(Arc::new(fs.clone()), Arc::new(engine)));

        let config = TransportConfig {
            locking: true,
            entries: vec![EntryConfig::new("mem:///in")],
        };
        let scheduler = PollScheduler::from_config(scanner, &config, Duration::from_millis(5))
            .await
            .unwrap();

        scheduler.start().await;
        assert!(scheduler.is_running().await);

        let request = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.headers.get(FILE_NAME), Some("a.xml"));

        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
    }
}
