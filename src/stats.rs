//! Endpoint statistics counters.
//!
//! Counters are plain atomics updated on the hot paths; snapshots are
//! eventually consistent and never take a lock.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct Statistics {
    started_at: DateTime<Utc>,
    received_messages: AtomicU64,
    received_bytes: AtomicU64,
    sent_messages: AtomicU64,
    sent_bytes: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Statistics {
            started_at: Utc::now(),
            received_messages: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
            sent_messages: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_received(&self, bytes: u64) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self, bytes: u64) {
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            started_at: self.started_at,
            uptime: Utc::now() - self.started_at,
            received_messages: self.received_messages.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            sent_messages: self.sent_messages.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of an endpoint's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime: chrono::Duration,
    pub received_messages: u64,
    pub received_bytes: u64,
    pub sent_messages: u64,
    pub sent_bytes: u64,
}

impl std::fmt::Display for StatisticsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "up {}s, rx {} msgs / {} bytes, tx {} msgs / {} bytes",
            self.uptime.num_seconds(),
            self.received_messages,
            self.received_bytes,
            self.sent_messages,
            self.sent_bytes
        )
    }
}
