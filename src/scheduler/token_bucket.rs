use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;

/// Awaitable token bucket. Starts full (a burst of `capacity` passes
/// immediately) and refills continuously at `capacity / interval`.
///
/// A waiter computes the instant its token will have accrued and sleeps
/// until then while holding the bucket lock. `tokio::sync::Mutex` hands the
/// lock out in FIFO order, so waiters are admitted in arrival order and
/// later arrivals cannot steal an earlier waiter's token.
pub struct TokenBucket {
    inner: Mutex<BucketInner>,
}

struct BucketInner {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(requests_per_interval: u32, interval: Duration) -> Self {
        let capacity = requests_per_interval as f64;
        let rate_per_sec = capacity / interval.as_secs_f64();
        Self {
            inner: Mutex::new(BucketInner {
                tokens: capacity,
                capacity,
                rate_per_sec,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait for one token and consume it. Returns `ScheduleCancelled` if the
    /// cancellation fires while queued or sleeping.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let mut inner = tokio::select! {
            guard = self.inner.lock() => guard,
            _ = cancel.cancelled() => return Err(ClientError::ScheduleCancelled),
        };

        inner.refill(Instant::now());
        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            return Ok(());
        }

        let deficit = 1.0 - inner.tokens;
        let wait = Duration::from_secs_f64(deficit / inner.rate_per_sec);
        let ready_at = Instant::now() + wait;
        tokio::select! {
            _ = tokio::time::sleep_until(ready_at) => {}
            _ = cancel.cancelled() => return Err(ClientError::ScheduleCancelled),
        }

        inner.refill(Instant::now());
        // Sleeping past `ready_at` guarantees at least one token accrued.
        inner.tokens = (inner.tokens - 1.0).max(0.0);
        Ok(())
    }

    /// Non-blocking probe used by tests.
    #[cfg(test)]
    pub async fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().await;
        inner.refill(Instant::now());
        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl BucketInner {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }
}
