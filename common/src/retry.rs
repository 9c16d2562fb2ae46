use std::time::Duration;

/// Attempts made for every retried store operation.
pub const ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Sleep `unit * n^2` after the n-th failed attempt.
    Quadratic(Duration),
    Fixed(Duration),
}

impl Backoff {
    fn delay(&self, failed: usize) -> Duration {
        match *self {
            Backoff::Quadratic(unit) => unit.saturating_mul((failed * failed) as u32),
            Backoff::Fixed(delay) => delay,
        }
    }
}

/// Run `op` until it succeeds or `attempts` attempts failed, returning the last error.
///
/// `op` receives the 0-based attempt number.
pub async fn retry<T, E, F, Fut>(what: &str, attempts: usize, backoff: Backoff, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    let mut failed = 0;
    loop {
        match op(failed).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                failed += 1;
                if failed >= attempts {
                    return Err(err);
                }
                tracing::warn!("{what}: attempt {failed}/{attempts} failed: {err:#}, retrying");
                tokio::time::sleep(backoff.delay(failed)).await;
            }
        }
    }
}
