//! Pacing for identify, which the platform rate limits per token.
//!
//! Going over the limit gets new sessions rejected for a while, so every shard
//! asks an [`IdentifyLimiter`] before it identifies. Share one limiter between
//! every client using the same token. For shards split over several processes,
//! implement the trait on top of something they can all see (a lock in Redis,
//! a coordinator service, ...).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep_until, Instant};

#[async_trait]
pub trait IdentifyLimiter: Send + Sync {
    /// Resolves once `shard_id` may send its identify. The caller identifies
    /// right after, so returning counts as using the slot.
    async fn acquire(&self, shard_id: u32);
}

/// In-process limiter: at most one identify per `interval` in each of
/// `max_concurrency` buckets. Shard `n` uses bucket `n % max_concurrency`.
///
/// Waiters are served in the order they arrived.
pub struct LocalIdentifyLimiter {
    interval: Duration,
    buckets: Vec<tokio::sync::Mutex<Option<Instant>>>,
}

impl LocalIdentifyLimiter {
    pub fn new(interval: Duration, max_concurrency: u32) -> Self {
        let buckets = (0..max_concurrency.max(1))
            .map(|_| tokio::sync::Mutex::new(None))
            .collect();
        Self { interval, buckets }
    }

    /// The limiter every client in this process shares for `token`.
    ///
    /// Settings only apply when the first client for a token asks.
    pub fn shared(token: &str, interval: Duration, max_concurrency: u32) -> Arc<Self> {
        static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<LocalIdentifyLimiter>>>> =
            OnceLock::new();

        let mut registry = REGISTRY
            .get_or_init(Default::default)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        registry
            .entry(token.to_string())
            .or_insert_with(|| Arc::new(Self::new(interval, max_concurrency)))
            .clone()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl IdentifyLimiter for LocalIdentifyLimiter {
    async fn acquire(&self, shard_id: u32) {
        let bucket = &self.buckets[shard_id as usize % self.buckets.len()];
        let mut last = bucket.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.interval;
            if ready_at > Instant::now() {
                log::debug!(
                    "shard {shard_id} waiting {:?} for its identify slot",
                    ready_at.saturating_duration_since(Instant::now())
                );
                sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_identify_is_immediate() {
        let limiter = LocalIdentifyLimiter::new(Duration::from_secs(5), 1);
        let start = Instant::now();
        limiter.acquire(0).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn consecutive_identifies_are_spaced() {
        let limiter = LocalIdentifyLimiter::new(Duration::from_millis(100), 1);
        let start = Instant::now();
        limiter.acquire(0).await;
        limiter.acquire(1).await;
        limiter.acquire(2).await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn buckets_run_in_parallel() {
        let limiter = LocalIdentifyLimiter::new(Duration::from_millis(300), 2);
        let start = Instant::now();
        limiter.acquire(0).await;
        limiter.acquire(1).await;
        assert!(start.elapsed() < Duration::from_millis(300));

        limiter.acquire(2).await;
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn shared_limiter_is_per_token() {
        let a = LocalIdentifyLimiter::shared("limiter-test-a", Duration::from_secs(5), 1);
        let again = LocalIdentifyLimiter::shared("limiter-test-a", Duration::from_secs(1), 4);
        let b = LocalIdentifyLimiter::shared("limiter-test-b", Duration::from_secs(5), 1);

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(again.interval(), Duration::from_secs(5));
    }
}
