//! Per-item and global rate limiting for the work queue.
//!
//! The delay for a re-added item is the max of an exponential per-item
//! failure backoff and a global token bucket, the same composition the
//! kubernetes workqueue uses.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token bucket refilled at `rate` tokens per second up to `burst`.
///
/// `reserve` always commits a token and returns how long the caller must wait
/// for it, so callers pace themselves without spinning.
pub(crate) struct TokenBucket {
    state: Mutex<BucketState>,
    rate: f64,
    burst: f64,
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub(crate) fn new(rate: u32, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: burst,
                last: Instant::now(),
            }),
            rate: f64::from(rate.max(1)),
            burst,
        }
    }

    /// Commit one token and return the wait until it is available.
    pub(crate) fn reserve(&self) -> Duration {
        let mut state = self.state.lock().expect("bucket mutex poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last = now;
        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.rate)
        }
    }
}

/// Max-of(exponential per-item backoff, global token bucket).
pub(crate) struct RateLimiter<T> {
    failures: Mutex<HashMap<T, u32>>,
    base: Duration,
    ceiling: Duration,
    bucket: TokenBucket,
}

impl<T: Clone + Eq + Hash> RateLimiter<T> {
    pub(crate) fn new(base: Duration, ceiling: Duration, rate: u32, burst: u32) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            base,
            ceiling,
            bucket: TokenBucket::new(rate, burst),
        }
    }

    /// Record a failure for `item` and return the delay before its next run.
    pub(crate) fn when(&self, item: &T) -> Duration {
        let exp = {
            let mut failures = self.failures.lock().expect("limiter mutex poisoned");
            let count = failures.entry(item.clone()).or_insert(0);
            let delay = exponential(self.base, *count, self.ceiling);
            *count = count.saturating_add(1);
            delay
        };
        exp.max(self.bucket.reserve())
    }

    /// Reset the failure count for `item`.
    pub(crate) fn forget(&self, item: &T) {
        self.failures
            .lock()
            .expect("limiter mutex poisoned")
            .remove(item);
    }

    #[cfg(test)]
    pub(crate) fn failure_count(&self, item: &T) -> u32 {
        self.failures
            .lock()
            .expect("limiter mutex poisoned")
            .get(item)
            .copied()
            .unwrap_or(0)
    }
}

fn exponential(base: Duration, failures: u32, ceiling: Duration) -> Duration {
    // base * 2^failures, saturating at the ceiling.
    let Some(mult) = 1u64.checked_shl(failures) else {
        return ceiling;
    };
    match base.checked_mul(u32::try_from(mult).unwrap_or(u32::MAX)) {
        Some(delay) if delay < ceiling => delay,
        _ => ceiling,
    }
}
