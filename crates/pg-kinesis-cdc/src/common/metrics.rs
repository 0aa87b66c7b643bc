//! Lock-free statistics for the bridge.
//!
//! All counters use `AtomicU64` with `Ordering::Relaxed` on the hot path.
//! The driver takes a snapshot-and-reset every statistics interval and
//! renders a single log line from it.

use crate::common::Operation;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters manipulated by the consumer task and the publisher.
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    skipped: AtomicU64,
    records_published: AtomicU64,
    publish_time_us: AtomicU64,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one parsed row change by operation kind.
    #[inline]
    pub fn record_op(&self, op: Operation) {
        let counter = match op {
            Operation::Insert => &self.inserts,
            Operation::Update => &self.updates,
            Operation::Delete => &self.deletes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one event dropped by the table filter.
    #[inline]
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Account records accepted downstream and the time the request took.
    #[inline]
    pub fn record_published(&self, records: u64, elapsed: Duration) {
        self.records_published.fetch_add(records, Ordering::Relaxed);
        self.publish_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Atomically capture a snapshot and reset all counters.
    pub fn snapshot_and_reset(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            inserts: self.inserts.swap(0, Ordering::Relaxed),
            updates: self.updates.swap(0, Ordering::Relaxed),
            deletes: self.deletes.swap(0, Ordering::Relaxed),
            skipped: self.skipped.swap(0, Ordering::Relaxed),
            records_published: self.records_published.swap(0, Ordering::Relaxed),
            publish_time_us: self.publish_time_us.swap(0, Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of all counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub skipped: u64,
    pub records_published: u64,
    pub publish_time_us: u64,
}

impl MetricsSnapshot {
    /// Events per second for one counter over the reporting window.
    #[inline]
    pub fn per_second(count: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        count as f64 / secs
    }

    /// Mean publish latency per record in milliseconds.
    #[inline]
    pub fn ms_per_record(&self) -> f64 {
        if self.records_published == 0 {
            return 0.0;
        }
        (self.publish_time_us as f64 / 1000.0) / self.records_published as f64
    }

    /// Cumulative time spent in publish requests, in seconds.
    #[inline]
    pub fn publish_secs(&self) -> f64 {
        self.publish_time_us as f64 / 1_000_000.0
    }
}
