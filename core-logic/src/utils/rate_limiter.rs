//! # Core Logic - Rate Limiting Utilities
//!
//! Token bucket shared by all dispatch workers when a target rate is set.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket implementation for rate limiting
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_per_sec: f64,
}

impl TokenBucket {
    /// Create a new token bucket with given capacity and refill rate (tokens/s)
    pub fn new(capacity: u64, refill_rate: u64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
            capacity: capacity.max(1) as f64,
            refill_per_sec: refill_rate.max(1) as f64,
        }
    }

    /// Bucket for a steady `tps`, allowing a burst of one second.
    pub fn per_second(tps: u32) -> Self {
        Self::new(tps as u64, tps as u64)
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            state.last_refill = now;
        }
    }

    /// Try to take one token. On failure returns how long until one is available.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }

    /// Wait for a token. Returns `false` if `shutdown` fired first.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        loop {
            let wait = match self.try_acquire() {
                Ok(()) => return true,
                Err(wait) => wait,
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Get available tokens
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.refill(&mut state);
        state.tokens as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_bucket_acquire() {
        let bucket = TokenBucket::new(10, 10);
        for _ in 0..5 {
            assert!(bucket.try_acquire().is_ok());
        }
        assert_eq!(bucket.available(), 5);
    }

    #[tokio::test]
    async fn test_empty_bucket_reports_wait() {
        let bucket = TokenBucket::new(1, 10);
        assert!(bucket.try_acquire().is_ok());

        let wait = bucket.try_acquire().unwrap_err();
        assert!(wait <= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_acquire_stops_on_shutdown() {
        let bucket = TokenBucket::new(1, 1);
        assert!(bucket.try_acquire().is_ok());

        let token = CancellationToken::new();
        token.cancel();
        assert!(!bucket.acquire(&token).await);
    }
}
