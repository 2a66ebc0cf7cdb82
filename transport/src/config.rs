//! Configuration and poll state for watched locations.

use std::path::Path;
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PollError, Result};
use crate::outcome::Outcome;

const DEFAULT_POLL_INTERVAL_MS: u64 = 300_000;
const DEFAULT_MAX_RETRY_COUNT: u32 = 3;
const DEFAULT_RECONNECT_TIMEOUT_MS: u64 = 30_000;

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_max_retry_count() -> u32 {
    DEFAULT_MAX_RETRY_COUNT
}

fn default_reconnect_timeout_ms() -> u64 {
    DEFAULT_RECONNECT_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

/// What to do with a file once it has been processed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Delete the file.
    #[default]
    Delete,

    /// Move the file into a destination folder.
    Move {
        /// URI of the destination folder.
        destination: String,

        /// `strftime` format whose rendering of the current time prefixes
        /// the moved file's name, e.g. `%Y%m%d-`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp_format: Option<String>,
    },
}

impl Action {
    /// Move into `destination` without a timestamp prefix.
    pub fn move_to(destination: impl Into<String>) -> Self {
        Self::Move {
            destination: destination.into(),
            timestamp_format: None,
        }
    }

    /// Move into `destination`, prefixing names with a timestamp.
    pub fn move_with_timestamp(destination: impl Into<String>, format: impl Into<String>) -> Self {
        Self::Move {
            destination: destination.into(),
            timestamp_format: Some(format.into()),
        }
    }

    fn validate(&self) -> Result<()> {
        let Self::Move {
            destination,
            timestamp_format,
        } = self
        else {
            return Ok(());
        };
        if destination.trim().is_empty() {
            return Err(PollError::Config("move destination is empty".to_string()));
        }
        if let Some(format) = timestamp_format {
            if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
                return Err(PollError::Config(format!(
                    "invalid timestamp format: {format}"
                )));
            }
        }
        Ok(())
    }
}

/// Static configuration of one watched location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryConfig {
    /// File or folder to poll.
    pub file_uri: String,

    /// Declared content type; inferred per file when absent.
    #[serde(default)]
    pub content_type: Option<String>,

    /// Regex a child's base name must fully match. Only consulted when the
    /// location is a folder.
    #[serde(default)]
    pub file_name_pattern: Option<String>,

    /// Delay between successive polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Whether to claim files before processing. Inherits the transport
    /// wide setting when absent.
    #[serde(default)]
    pub locking: Option<bool>,

    /// Resolution attempts before the cycle is abandoned.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    /// Delay between resolution attempts.
    #[serde(default = "default_reconnect_timeout_ms")]
    pub reconnect_timeout_ms: u64,

    /// Disposal after successful processing.
    #[serde(default)]
    pub action_after_process: Action,

    /// Disposal after failed processing.
    #[serde(default)]
    pub action_after_failure: Action,

    /// Where the engine should send correlated replies.
    #[serde(default)]
    pub reply_file_uri: Option<String>,

    /// Prefer handing content to builders without buffering it.
    #[serde(default)]
    pub streaming: bool,

    /// Upper bound on building and dispatching one file.
    #[serde(default)]
    pub dispatch_timeout_ms: Option<u64>,
}

impl EntryConfig {
    /// Create a configuration with default policy for `file_uri`.
    pub fn new(file_uri: impl Into<String>) -> Self {
        Self {
            file_uri: file_uri.into(),
            content_type: None,
            file_name_pattern: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            locking: None,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            reconnect_timeout_ms: DEFAULT_RECONNECT_TIMEOUT_MS,
            action_after_process: Action::Delete,
            action_after_failure: Action::Delete,
            reply_file_uri: None,
            streaming: false,
            dispatch_timeout_ms: None,
        }
    }

    /// Set the declared content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set the file name pattern.
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.file_name_pattern = Some(pattern.into());
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_ms(interval);
        self
    }

    /// Enable or disable locking for this entry.
    pub fn with_locking(mut self, locking: bool) -> Self {
        self.locking = Some(locking);
        self
    }

    /// Set the resolution retry bound and spacing.
    pub fn with_retry(mut self, max_retry_count: u32, reconnect_timeout: Duration) -> Self {
        self.max_retry_count = max_retry_count;
        self.reconnect_timeout_ms = duration_ms(reconnect_timeout);
        self
    }

    /// Set the disposal after success.
    pub fn after_process(mut self, action: Action) -> Self {
        self.action_after_process = action;
        self
    }

    /// Set the disposal after failure.
    pub fn after_failure(mut self, action: Action) -> Self {
        self.action_after_failure = action;
        self
    }

    /// Set the reply location.
    pub fn with_reply_uri(mut self, uri: impl Into<String>) -> Self {
        self.reply_file_uri = Some(uri.into());
        self
    }

    /// Prefer streaming delivery.
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Bound the time spent building and dispatching one file.
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout_ms = Some(duration_ms(timeout));
        self
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Mutable poll state of an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollState {
    /// Outcome of the last cycle that processed anything.
    pub last_poll_state: Outcome,

    /// When that cycle completed.
    pub last_poll_time: Option<DateTime<Utc>>,

    /// When the entry is next due.
    pub next_poll_time: Option<DateTime<Utc>>,
}

/// A validated entry together with its poll state.
#[derive(Debug, Clone)]
pub struct PollEntry {
    config: EntryConfig,
    pattern: Option<Regex>,
    locking: bool,
    state: PollState,
}

impl PollEntry {
    /// Validate a configuration. Locking defaults to enabled.
    pub fn new(config: EntryConfig) -> Result<Self> {
        Self::with_default_locking(config, true)
    }

    /// Validate a configuration, using `default_locking` when the entry does
    /// not say.
    pub fn with_default_locking(config: EntryConfig, default_locking: bool) -> Result<Self> {
        if config.file_uri.trim().is_empty() {
            return Err(PollError::Config("file_uri is empty".to_string()));
        }
        config.action_after_process.validate()?;
        config.action_after_failure.validate()?;

        let pattern = config
            .file_name_pattern
            .as_deref()
            .map(|p| Regex::new(&format!("^(?:{p})$")))
            .transpose()?;

        Ok(Self {
            locking: config.locking.unwrap_or(default_locking),
            config,
            pattern,
            state: PollState::default(),
        })
    }

    /// The static configuration.
    pub fn config(&self) -> &EntryConfig {
        &self.config
    }

    /// URI of the watched location.
    pub fn file_uri(&self) -> &str {
        &self.config.file_uri
    }

    /// Whether files are claimed before processing.
    pub fn locking_enabled(&self) -> bool {
        self.locking
    }

    /// Declared content type. A blank declaration counts as none.
    pub fn content_type(&self) -> Option<&str> {
        self.config
            .content_type
            .as_deref()
            .map(str::trim)
            .filter(|declared| !declared.is_empty())
    }

    /// Reply location, if any.
    pub fn reply_file_uri(&self) -> Option<&str> {
        self.config.reply_file_uri.as_deref()
    }

    /// Whether streaming delivery is preferred.
    pub fn streaming(&self) -> bool {
        self.config.streaming
    }

    /// Delay between polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    /// Resolution attempts per cycle, at least one.
    pub fn max_retry_count(&self) -> u32 {
        self.config.max_retry_count.max(1)
    }

    /// Delay between resolution attempts.
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.config.reconnect_timeout_ms)
    }

    /// Bound on building and dispatching one file.
    pub fn dispatch_timeout(&self) -> Option<Duration> {
        self.config.dispatch_timeout_ms.map(Duration::from_millis)
    }

    /// Disposal for the given per-file outcome, `None` for anything but
    /// `Success` or `Failed`.
    pub fn action_for(&self, outcome: Outcome) -> Option<&Action> {
        match outcome {
            Outcome::Success => Some(&self.config.action_after_process),
            Outcome::Failed => Some(&self.config.action_after_failure),
            Outcome::None | Outcome::PartialFailure => None,
        }
    }

    /// Whether a child with this base name is eligible.
    pub fn matches(&self, base_name: &str) -> bool {
        self.pattern
            .as_ref()
            .is_none_or(|pattern| pattern.is_match(base_name))
    }

    /// Current poll state.
    pub fn state(&self) -> &PollState {
        &self.state
    }

    /// Record a completed cycle.
    pub(crate) fn record_poll(&mut self, outcome: Outcome, now: DateTime<Utc>) {
        let interval =
            chrono::Duration::from_std(self.poll_interval()).unwrap_or(chrono::Duration::MAX);
        self.state.last_poll_state = outcome;
        self.state.last_poll_time = Some(now);
        self.state.next_poll_time = Some(now.checked_add_signed(interval).unwrap_or(now));
    }
}

/// Transport wide configuration: global defaults plus the watched entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Default locking for entries that do not set it.
    #[serde(default = "default_true")]
    pub locking: bool,

    /// Watched locations.
    #[serde(default)]
    pub entries: Vec<EntryConfig>,
}

impl TransportConfig {
    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON document from disk.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&json)
    }

    /// Validate every entry, resolving its locking flag once.
    pub fn build_entries(&self) -> Result<Vec<PollEntry>> {
        self.entries
            .iter()
            .cloned()
            .map(|config| PollEntry::with_default_locking(config, self.locking))
            .collect()
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            locking: true,
            entries: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_entry_config_builder() {
        let config = EntryConfig::new("mem:///in")
            .with_content_type("text/xml")
            .with_pattern(r".*\.xml")
            .with_retry(5, Duration::from_secs(2))
            .after_process(Action::move_to("mem:///done"))
            .streaming();

        assert_eq!(config.max_retry_count, 5);
        assert_eq!(config.reconnect_timeout_ms, 2000);
        assert_eq!(config.action_after_failure, Action::Delete);
        assert!(config.streaming);
    }

    #[test]
    fn test_pattern_must_match_whole_name() {
        let entry = PollEntry::new(EntryConfig::new("mem:///in").with_pattern(r".*\.xml")).unwrap();
        assert!(entry.matches("order.xml"));
        assert!(!entry.matches("order.xml.bak"));
        assert!(!entry.matches("order.txt"));
    }

    #[test]
    fn test_no_pattern_matches_everything() {
        let entry = PollEntry::new(EntryConfig::new("mem:///in")).unwrap();
        assert!(entry.matches("anything.bin"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let result = PollEntry::new(EntryConfig::new("mem:///in").with_pattern("(unclosed"));
        assert!(matches!(result, Err(PollError::InvalidPattern(_))));
    }

    #[test]
    fn test_invalid_move_action_is_rejected() {
        let empty = EntryConfig::new("mem:///in").after_failure(Action::move_to(" "));
        assert!(matches!(PollEntry::new(empty), Err(PollError::Config(_))));

        let bad_format = EntryConfig::new("mem:///in")
            .after_process(Action::move_with_timestamp("mem:///done", "%Y%Q"));
        assert!(matches!(PollEntry::new(bad_format), Err(PollError::Config(_))));
    }

    #[test]
    fn test_retry_count_is_at_least_one() {
        let entry =
            PollEntry::new(EntryConfig::new("mem:///in").with_retry(0, Duration::ZERO)).unwrap();
        assert_eq!(entry.max_retry_count(), 1);
    }

    #[test]
    fn test_record_poll_schedules_next() {
        let mut entry = PollEntry::new(
            EntryConfig::new("mem:///in").with_poll_interval(Duration::from_secs(60)),
        )
        .unwrap();
        let now = Utc::now();
        entry.record_poll(Outcome::Success, now);

        assert_eq!(entry.state().last_poll_state, Outcome::Success);
        assert_eq!(entry.state().last_poll_time, Some(now));
        assert_eq!(
            entry.state().next_poll_time,
            Some(now + chrono::Duration::seconds(60))
        );
    }

    #[test]
    fn test_poll_state_round_trips_through_json() {
        let mut entry = PollEntry::new(EntryConfig::new("mem:///in")).unwrap();
        entry.record_poll(Outcome::PartialFailure, Utc::now());

        let json = serde_json::to_string(entry.state()).unwrap();
        let restored: PollState = serde_json::from_str(&json).unwrap();

        assert_eq!(&restored, entry.state());
    }

    #[test]
    fn test_blank_content_type_counts_as_none() {
        let entry = PollEntry::new(EntryConfig::new("mem:///in").with_content_type(" ")).unwrap();
        assert_eq!(entry.content_type(), None);
    }

    #[test]
    fn test_transport_config_from_json() {
        let json = r#"{
            "locking": false,
            "entries": [
                {
                    "file_uri": "file:///var/spool/in",
                    "file_name_pattern": ".*\\.xml",
                    "content_type": "text/xml; charset=UTF-8",
                    "action_after_process": {
                        "action": "move",
                        "destination": "file:///var/spool/done",
                        "timestamp_format": "%Y%m%d-"
                    },
                    "action_after_failure": { "action": "delete" }
                },
                {
                    "file_uri": "file:///var/spool/single.txt",
                    "locking": true
                }
            ]
        }"#;

        let config = TransportConfig::from_json_str(json).unwrap();
        let entries = config.build_entries().unwrap();

        assert_eq!(entries.len(), 2);
        assert!(!entries[0].locking_enabled());
        assert!(entries[1].locking_enabled());
        assert_eq!(entries[0].max_retry_count(), 3);
        assert_eq!(
            entries[0].config().action_after_process,
            Action::move_with_timestamp("file:///var/spool/done", "%Y%m%d-")
        );
        assert_eq!(entries[1].poll_interval(), Duration::from_millis(300_000));
    }

    #[tokio::test]
    async fn test_load_from_disk() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("transport.json");
        std::fs::write(&path, r#"{ "entries": [ { "file_uri": "mem:///in" } ] }"#).unwrap();

        let config = TransportConfig::load(&path).await.unwrap();
        assert!(config.locking);
        assert_eq!(config.entries, vec![EntryConfig::new("mem:///in")]);
    }
}
