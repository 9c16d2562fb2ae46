//! Bandwidth limiting and concurrency gating for object transfers
//!
//! Two primitives are shared by every component that moves object bytes:
//!
//! 1. **Bandwidth Limiter** - a token bucket where one token is one byte. The configured
//!    bytes/sec limit is reduced by [`OVERHEAD_FACTOR`] to leave room for protocol overhead, and
//!    the bucket holds [`BURST_SECONDS`] seconds of traffic.
//! 2. **Concurrency Gate** - a counting semaphore bounding the number of simultaneous
//!    part uploads, chunk comparisons and range fetches across all workers combined.
//!
//! ```rust,no_run
//! # async fn example() {
//! // 100 MiB/s before overhead
//! let limiter = throttle::BandwidthLimiter::new(Some(100 << 20));
//! let gate = throttle::ConcurrencyGate::new(10);
//!
//! let _permit = gate.enter().await;
//! limiter.acquire(5 << 20).await;
//! // transfer 5 MiB here
//! # }
//! ```
//!
//! Both are cheap to clone and every clone refers to the same underlying state.
//!
//! # Replenishment
//!
//! The limiter refills the bucket from a background task every [`REPLENISH_INTERVAL`], adding
//! tokens proportional to the time actually elapsed. The task holds only a weak reference to the
//! bucket and exits once the last limiter handle is dropped.

mod semaphore;

use std::sync::Arc;
use std::time::Duration;

pub use semaphore::Gate as ConcurrencyGate;
use semaphore::TokenBucket;

/// Fraction of the configured limit actually handed out as tokens.
pub const OVERHEAD_FACTOR: f64 = 0.85;

/// Bucket capacity expressed in seconds of traffic at the effective rate.
pub const BURST_SECONDS: f64 = 3.0;

pub const REPLENISH_INTERVAL: Duration = Duration::from_millis(100);

/// Shared token bucket limiting transferred bytes per second.
///
/// A limiter created without a limit is a no-op.
#[derive(Debug, Clone, Default)]
pub struct BandwidthLimiter {
    bucket: Option<Arc<TokenBucket>>,
}

impl BandwidthLimiter {
    /// Create a limiter for `bytes_per_sec` (before overhead), `None` or `Some(0)` disables it.
    ///
    /// Must be called from within a tokio runtime when a limit is set.
    pub fn new(bytes_per_sec: Option<u64>) -> Self {
        let Some(limit) = bytes_per_sec.filter(|limit| *limit > 0) else {
            return Self::default();
        };
        let rate = limit as f64 * OVERHEAD_FACTOR;
        let capacity = (rate * BURST_SECONDS).ceil() as usize;
        let bucket = Arc::new(TokenBucket::new(rate, capacity));
        tracing::debug!(
            "bandwidth limit: {} bytes/s effective, burst {} bytes",
            rate,
            bucket.capacity()
        );
        tokio::spawn(run_replenish_thread(Arc::downgrade(&bucket)));
        Self {
            bucket: Some(bucket),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.bucket.is_some()
    }

    /// Effective rate in bytes/sec after the overhead reduction.
    pub fn rate(&self) -> Option<f64> {
        self.bucket.as_ref().map(|bucket| bucket.rate())
    }

    /// Wait until `bytes` tokens are available and take them.
    pub async fn acquire(&self, bytes: u64) {
        if let Some(bucket) = &self.bucket {
            bucket.consume(bytes).await;
        }
    }
}

async fn run_replenish_thread(bucket: std::sync::Weak<TokenBucket>) {
    let mut interval = tokio::time::interval(REPLENISH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last = tokio::time::Instant::now();
    let mut carry = 0.0;
    loop {
        interval.tick().await;
        let Some(bucket) = bucket.upgrade() else {
            tracing::trace!("bandwidth limiter dropped, stopping replenish");
            return;
        };
        let now = tokio::time::Instant::now();
        bucket.replenish(now - last, &mut carry);
        last = now;
    }
}
