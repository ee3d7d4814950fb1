// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Rate limiters that decide how long a failed item waits before it is
//! handed out again by the work queue.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::WorkQueueConfig;

/// Decides the delay before an item is retried.
pub trait RateLimiter<T>: Send + Sync {
    /// Returns how long the item should wait, and records the attempt.
    fn when(&self, item: &T) -> Duration;

    /// Stops tracking the item. Called once the item converged.
    fn forget(&self, item: &T);

    /// Returns how many times the item has been rate limited since it was
    /// last forgotten.
    fn num_requeues(&self, item: &T) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> ItemExponentialFailureRateLimiter<T> {
    /// Creates a limiter with the given base and maximum delay.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> RateLimiter<T> for ItemExponentialFailureRateLimiter<T>
where
    T: Clone + Eq + Hash + Send,
{
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |backoff| backoff.min(self.max))
    }

    fn forget(&self, item: &T) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item)
            .copied()
            .unwrap_or(0)
    }
}

/// Overall token bucket shared by all items.
///
/// Tokens may go negative: each call reserves the next token and returns how
/// long the caller has to wait for it. A `qps` that is zero, negative or not
/// finite disables the bucket.
#[derive(Debug)]
pub struct BucketRateLimiter {
    qps: Option<f64>,
    burst: f64,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    /// Creates a bucket that refills at `qps` tokens per second and holds at
    /// most `burst` tokens.
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: (qps.is_finite() && qps > 0.0).then_some(qps),
            burst,
            state: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        let Some(qps) = self.qps else {
            return Duration::ZERO;
        };
        let mut bucket = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / qps).unwrap_or(Duration::MAX)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Combines several limiters and waits for the slowest one.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    /// Creates a limiter from its members.
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T>
where
    T: Send + Sync,
{
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Builds the limiter used by every controller: per-item exponential backoff
/// combined with an overall token bucket.
pub fn default_controller_rate_limiter<T>(config: &WorkQueueConfig) -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            config.base_delay,
            config.max_delay,
        )),
        Box::new(BucketRateLimiter::new(config.qps, config.burst)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
        let delays: Vec<_> = (0..10).map(|_| limiter.when(&"a")).collect();

        assert_eq!(delays[0], Duration::from_millis(5));
        assert_eq!(delays[1], Duration::from_millis(10));
        assert_eq!(delays[2], Duration::from_millis(20));
        assert_eq!(delays[7], Duration::from_millis(640));
        assert_eq!(delays[8], Duration::from_secs(1));
        assert_eq!(delays[9], Duration::from_secs(1));
        assert_eq!(limiter.num_requeues(&"a"), 10);
    }

    #[test]
    fn test_exponential_backoff_is_per_item() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(10));
        limiter.when(&"a");
        limiter.when(&"a");

        assert_eq!(limiter.when(&"b"), Duration::from_millis(1));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(4));
    }

    #[test]
    fn test_forget_resets_backoff() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(10));
        limiter.when(&"a");
        limiter.when(&"a");
        limiter.forget(&"a");

        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(1));
    }

    #[test]
    fn test_backoff_survives_huge_failure_counts() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        );
        for _ in 0..100 {
            limiter.when(&"a");
        }
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_allows_burst_then_throttles() {
        let limiter = BucketRateLimiter::new(10.0, 2);

        assert_eq!(RateLimiter::<&str>::when(&limiter, &"a"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"b"), Duration::ZERO);

        let wait = RateLimiter::<&str>::when(&limiter, &"c");
        assert!(wait > Duration::from_millis(90) && wait <= Duration::from_millis(100));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"d"), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_without_positive_qps_never_throttles() {
        for qps in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let limiter = BucketRateLimiter::new(qps, 1);
            for item in ["a", "b", "c"] {
                assert_eq!(RateLimiter::<&str>::when(&limiter, &item), Duration::ZERO);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_with_tiny_qps_saturates_delay() {
        let limiter = BucketRateLimiter::new(f64::MIN_POSITIVE, 1);

        assert_eq!(RateLimiter::<&str>::when(&limiter, &"a"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"b"), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_of_takes_longest_delay() {
        let limiter: MaxOfRateLimiter<&str> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(5),
                Duration::from_secs(1),
            )),
            Box::new(BucketRateLimiter::new(1.0, 1)),
        ]);

        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        // bucket is empty now and needs a full second for the next token
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1));
        assert_eq!(limiter.num_requeues(&"a"), 2);

        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
    }
}
