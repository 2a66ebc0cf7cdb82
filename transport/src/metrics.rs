//! Counters for received messages and failures.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Running totals kept by a transport.
#[derive(Debug, Default)]
pub struct TransportMetrics {
    messages_received: AtomicU64,
    faults_receiving: AtomicU64,
    bytes_received: AtomicU64,
    fatal_entry_failures: AtomicU64,
    disposal_failures: AtomicU64,
}

/// Point in time copy of [`TransportMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub faults_receiving: u64,
    pub bytes_received: u64,
    pub fatal_entry_failures: u64,
    pub disposal_failures: u64,
}

impl TransportMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// A message was dispatched successfully.
    pub fn record_received(&self, bytes: Option<u64>) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        if let Some(bytes) = bytes {
            self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// A file could not be built or dispatched.
    pub fn record_fault(&self) {
        self.faults_receiving.fetch_add(1, Ordering::Relaxed);
    }

    /// An entry could not be resolved within its retry bound.
    pub fn record_fatal(&self) {
        self.fatal_entry_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A move or delete failed.
    pub fn record_disposal_failure(&self) {
        self.disposal_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            faults_receiving: self.faults_receiving.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            fatal_entry_failures: self.fatal_entry_failures.load(Ordering::Relaxed),
            disposal_failures: self.disposal_failures.load(Ordering::Relaxed),
        }
    }
}
