//! Rate limiting for collaborator calls.
//!
//! A limiter is injected into the engine and shared by every step of a run
//! (and by every run of the engine). Nothing here is global.

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::workflow::model::RateLimitSpec;

/// Gate in front of every collaborator call.
pub trait RateLimit: Send + Sync {
    /// Takes a permit if one is available right now.
    fn try_acquire(&self) -> bool;

    /// Blocks until a permit is available.
    fn acquire(&self);
}

/// Never blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl RateLimit for Unlimited {
    fn try_acquire(&self) -> bool {
        true
    }

    fn acquire(&self) {}
}

/// Token bucket rate limiter.
///
/// Tokens refill continuously at `capacity / period` up to `capacity`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use opflow::execution::rate_limit::{RateLimit, TokenBucket};
///
/// // 5 calls per second
/// let limiter = TokenBucket::new(5, Duration::from_secs(1));
/// assert!(limiter.try_acquire());
/// ```
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

struct BucketState {
    capacity: f64,
    tokens: f64,
    refill_period: Duration,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let added = elapsed.as_secs_f64() / self.refill_period.as_secs_f64() * self.capacity;
        self.tokens = (self.tokens + added).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until one token is available.
    fn wait_time(&self) -> Duration {
        let missing = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(missing / self.capacity * self.refill_period.as_secs_f64())
    }
}

impl TokenBucket {
    pub fn new(max_operations: u32, period: Duration) -> Self {
        let capacity = f64::from(max_operations.max(1));
        let period = if period.is_zero() { Duration::from_secs(1) } else { period };
        Self {
            state: Mutex::new(BucketState {
                capacity,
                tokens: capacity,
                refill_period: period,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Builds a bucket from a workflow's `security.rate_limit`.
    pub fn from_spec(spec: &RateLimitSpec) -> Self {
        Self::new(spec.max_requests, Duration::from_secs(spec.per_seconds))
    }

    /// Whole permits available right now.
    pub fn available(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.refill();
        state.tokens.floor() as usize
    }
}

impl RateLimit for TokenBucket {
    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.refill();
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.refill();
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                state.wait_time()
            };
            thread::sleep(wait.max(Duration::from_millis(1)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_drains() {
        let limiter = TokenBucket::new(3, Duration::from_secs(60));
        assert_eq!(limiter.available(), 3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_acquire_waits_for_refill() {
        let limiter = TokenBucket::new(1, Duration::from_millis(50));
        limiter.acquire();

        let start = Instant::now();
        limiter.acquire();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_from_spec() {
        let limiter = TokenBucket::from_spec(&RateLimitSpec {
            max_requests: 2,
            per_seconds: 1,
        });
        assert_eq!(limiter.available(), 2);
    }

    #[test]
    fn test_unlimited() {
        let limiter = Unlimited;
        for _ in 0..1000 {
            assert!(limiter.try_acquire());
        }
    }
}
