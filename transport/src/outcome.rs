//! Per-file and per-cycle processing outcomes.

use serde::{Deserialize, Serialize};

/// Result of processing a file, or of a whole poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Nothing was processed.
    #[default]
    None,

    /// Everything processed succeeded.
    Success,

    /// Everything processed failed.
    Failed,

    /// Some files succeeded and some failed.
    PartialFailure,
}

/// Tally of per-file outcomes within one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    succeeded: usize,
    failed: usize,
}

impl BatchOutcome {
    /// Create an empty tally.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one file. Only `Success` and `Failed` count.
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.succeeded += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::None | Outcome::PartialFailure => {}
        }
    }

    /// Number of files that succeeded.
    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    /// Number of files that failed.
    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Number of files processed.
    pub fn attempts(&self) -> usize {
        self.succeeded + self.failed
    }

    /// The cycle outcome.
    pub fn outcome(&self) -> Outcome {
        match (self.succeeded, self.failed) {
            (0, 0) => Outcome::None,
            (_, 0) => Outcome::Success,
            (0, _) => Outcome::Failed,
            _ => Outcome::PartialFailure,
        }
    }
}

impl FromIterator<Outcome> for BatchOutcome {
    fn from_iter<I: IntoIterator<Item = Outcome>>(iter: I) -> Self {
        let mut batch = Self::new();
        for outcome in iter {
            batch.record(outcome);
        }
        batch
    }
}
