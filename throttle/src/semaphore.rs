//! Semaphore-backed primitives: a byte token bucket and a counting gate.

use std::time::Duration;

/// Token bucket where one permit is one byte.
///
/// The bucket starts full. Tokens are added by [`TokenBucket::replenish`] proportionally to the
/// elapsed time and never accumulate above `capacity` while idle.
#[derive(Debug)]
pub struct TokenBucket {
    sem: tokio::sync::Semaphore,
    capacity: usize,
    rate: f64,
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: usize) -> Self {
        let capacity = capacity.clamp(1, tokio::sync::Semaphore::MAX_PERMITS);
        Self {
            sem: tokio::sync::Semaphore::new(capacity),
            capacity,
            rate,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Block until `tokens` bytes worth of permits were taken out of the bucket.
    ///
    /// Requests larger than the bucket are served in capacity-sized slices so they can't
    /// starve forever.
    pub async fn consume(&self, tokens: u64) {
        let mut remaining = tokens;
        while remaining > 0 {
            let step = remaining
                .min(self.capacity as u64)
                .min(u64::from(u32::MAX));
            // the semaphore is never closed
            let Ok(permit) = self.sem.acquire_many(step as u32).await else {
                return;
            };
            permit.forget();
            remaining -= step;
        }
    }

    /// Add the tokens earned over `elapsed`; `carry` keeps the fractional remainder between calls.
    pub fn replenish(&self, elapsed: Duration, carry: &mut f64) {
        let due = elapsed.as_secs_f64() * self.rate + *carry;
        let whole = due.floor();
        *carry = due - whole;
        let room = self.capacity.saturating_sub(self.sem.available_permits());
        let add = (whole as usize).min(room);
        if add > 0 {
            self.sem.add_permits(add);
        }
    }
}

/// Counting semaphore bounding concurrent sub-transfers across all workers.
#[derive(Debug, Clone)]
pub struct Gate {
    sem: std::sync::Arc<tokio::sync::Semaphore>,
    size: usize,
}

impl Gate {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            sem: std::sync::Arc::new(tokio::sync::Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    pub async fn enter(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        self.sem.clone().acquire_owned().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bucket_starts_full_and_caps_replenish() {
        let bucket = TokenBucket::new(100.0, 300);
        bucket.consume(300).await;
        let mut carry = 0.0;
        bucket.replenish(Duration::from_secs(10), &mut carry);
        // ten seconds of traffic but only room for the burst
        assert_eq!(bucket.sem.available_permits(), 300);
    }

    #[tokio::test]
    async fn replenish_keeps_fraction() {
        let bucket = TokenBucket::new(15.0, 100);
        bucket.consume(100).await;
        let mut carry = 0.0;
        bucket.replenish(Duration::from_millis(100), &mut carry);
        assert_eq!(bucket.sem.available_permits(), 1);
        bucket.replenish(Duration::from_millis(100), &mut carry);
        assert_eq!(bucket.sem.available_permits(), 3);
        assert!(carry < 1.0);
    }

    #[tokio::test]
    async fn gate_limits_holders() {
        let gate = Gate::new(2);
        let a = gate.enter().await;
        let b = gate.enter().await;
        assert!(a.is_some() && b.is_some());
        assert_eq!(gate.available(), 0);
        drop(a);
        assert_eq!(gate.available(), 1);
    }
}
