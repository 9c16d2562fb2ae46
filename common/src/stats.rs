//! Run-scoped counters and the context handed to every component.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn take(&self) -> u64 {
        self.0.swap(0, Ordering::AcqRel)
    }
}

/// Counter values, either a snapshot or a delta pushed by a cluster worker.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub copied: u64,
    pub copied_bytes: u64,
    pub checked: u64,
    pub checked_bytes: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub failed: u64,
    #[serde(default)]
    pub handled: u64,
}

impl Stat {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl std::ops::Add for Stat {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            copied: self.copied + other.copied,
            copied_bytes: self.copied_bytes + other.copied_bytes,
            checked: self.checked + other.checked,
            checked_bytes: self.checked_bytes + other.checked_bytes,
            deleted: self.deleted + other.deleted,
            skipped: self.skipped + other.skipped,
            failed: self.failed + other.failed,
            handled: self.handled + other.handled,
        }
    }
}

impl std::fmt::Display for Stat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "copied: {} ({})\n\
            checked: {} ({})\n\
            deleted: {}\n\
            skipped: {}\n\
            failed: {}\n\
            handled: {}",
            self.copied,
            bytesize::ByteSize(self.copied_bytes),
            self.checked,
            bytesize::ByteSize(self.checked_bytes),
            self.deleted,
            self.skipped,
            self.failed,
            self.handled,
        )
    }
}

/// Live counters of one sync run.
#[derive(Debug)]
pub struct Stats {
    pub copied: Counter,
    pub copied_bytes: Counter,
    pub checked: Counter,
    pub checked_bytes: Counter,
    pub deleted: Counter,
    pub skipped: Counter,
    pub failed: Counter,
    pub handled: Counter,
    /// Keys classified by the differ, compared against `handled` at the end.
    pub total: Counter,
    start_time: std::time::Instant,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            copied: Default::default(),
            copied_bytes: Default::default(),
            checked: Default::default(),
            checked_bytes: Default::default(),
            deleted: Default::default(),
            skipped: Default::default(),
            failed: Default::default(),
            handled: Default::default(),
            total: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> Stat {
        Stat {
            copied: self.copied.get(),
            copied_bytes: self.copied_bytes.get(),
            checked: self.checked.get(),
            checked_bytes: self.checked_bytes.get(),
            deleted: self.deleted.get(),
            skipped: self.skipped.get(),
            failed: self.failed.get(),
            handled: self.handled.get(),
        }
    }

    /// Add a delta reported by someone else, e.g. a cluster worker.
    pub fn merge(&self, delta: &Stat) {
        self.copied.add(delta.copied);
        self.copied_bytes.add(delta.copied_bytes);
        self.checked.add(delta.checked);
        self.checked_bytes.add(delta.checked_bytes);
        self.deleted.add(delta.deleted);
        self.skipped.add(delta.skipped);
        self.failed.add(delta.failed);
        self.handled.add(delta.handled);
    }

    /// Take everything accumulated since the previous drain, leaving the counters at zero.
    ///
    /// `total` is not part of the delta. A caller that fails to deliver the delta gives it back
    /// with [`Stats::merge`].
    pub fn drain(&self) -> Stat {
        Stat {
            copied: self.copied.take(),
            copied_bytes: self.copied_bytes.take(),
            checked: self.checked.take(),
            checked_bytes: self.checked_bytes.take(),
            deleted: self.deleted.take(),
            skipped: self.skipped.take(),
            failed: self.failed.take(),
            handled: self.handled.take(),
        }
    }
}

/// Shared state of one run: counters, the bandwidth limiter and the concurrency gate.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub stats: Arc<Stats>,
    pub limiter: throttle::BandwidthLimiter,
    pub gate: throttle::ConcurrencyGate,
}

impl RunContext {
    /// `bandwidth` is in bytes/sec before overhead, must be called inside a tokio runtime.
    pub fn new(stats: Arc<Stats>, bandwidth: Option<u64>, concurrency: usize) -> Self {
        Self {
            stats,
            limiter: throttle::BandwidthLimiter::new(bandwidth),
            gate: throttle::ConcurrencyGate::new(concurrency),
        }
    }

    pub fn unlimited(concurrency: usize) -> Self {
        Self::new(Arc::new(Stats::new()), None, concurrency)
    }
}
