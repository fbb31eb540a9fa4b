//! Pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonic message counters, shared by the network thread and the runtime.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    retained_dropped: AtomicU64,
    rejected: AtomicU64,
    dispatched: AtomicU64,
    upserted: AtomicU64,
    failed: AtomicU64,
    published: AtomicU64,
    publish_failed: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub retained_dropped: u64,
    pub rejected: u64,
    pub dispatched: u64,
    pub upserted: u64,
    pub failed: u64,
    pub published: u64,
    pub publish_failed: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        bump(&self.received);
    }

    pub fn record_retained(&self) {
        bump(&self.retained_dropped);
    }

    pub fn record_rejected(&self) {
        bump(&self.rejected);
    }

    pub fn record_dispatched(&self) {
        bump(&self.dispatched);
    }

    pub fn record_upserted(&self) {
        bump(&self.upserted);
    }

    pub fn record_failed(&self) {
        bump(&self.failed);
    }

    pub fn record_published(&self) {
        bump(&self.published);
    }

    pub fn record_publish_failed(&self) {
        bump(&self.publish_failed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            retained_dropped: self.retained_dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            upserted: self.upserted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failed: self.publish_failed.load(Ordering::Relaxed),
        }
    }
}
