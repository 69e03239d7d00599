//! Observable proxy counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter bag shared by forwarders and mirror workers.
#[derive(Default)]
pub struct ProxyMetrics {
    packet_count: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    write_fails: AtomicU64,
    read_fails: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packet_count: u64,
    pub reads: u64,
    pub writes: u64,
    pub write_fails: u64,
    pub read_fails: u64,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// One frame forwarded, in either direction.
    pub fn record_packet(&self) {
        self.packet_count.fetch_add(1, Ordering::Relaxed);
    }

    /// One request classified as a read.
    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    /// One mirrored query delivered to the target.
    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// One mirrored query dropped after exhausting its retries.
    pub fn record_write_fail(&self) {
        self.write_fails.fetch_add(1, Ordering::Relaxed);
    }

    /// One reply frame the classifier could not inspect.
    pub fn record_read_fail(&self) {
        self.read_fails.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packet_count: self.packet_count.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_fails: self.write_fails.load(Ordering::Relaxed),
            read_fails: self.read_fails.load(Ordering::Relaxed),
        }
    }
}
