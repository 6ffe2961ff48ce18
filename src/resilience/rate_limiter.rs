//! Sliding-window failure rate limiter
//!
//! Tracks authentication failures per (client identity, protected resource)
//! pair. Reaching `max_failures` inside the trailing `window` blocks the pair
//! for `block_duration`. A success clears everything recorded for the pair.
//!
//! Blocks expire lazily when queried. Pairs left idle are dropped by
//! [`RateLimiter::prune_idle`], which the background supervisor runs on an
//! interval. Each pair has its own lock, so unrelated clients never contend
//! with each other.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::observability::MetricsRegistry;

/// Rate limiter thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Failures inside the window that trigger a block
    pub max_failures: u32,
    /// Trailing window failures are counted over
    pub window: Duration,
    /// How long a triggered block lasts
    pub block_duration: Duration,
}

impl RateLimitConfig {
    /// Create a rate limiter configuration
    pub fn new(max_failures: u32, window: Duration, block_duration: Duration) -> Self {
        Self {
            max_failures,
            window,
            block_duration,
        }
    }
}

type Key = (String, String);

#[derive(Debug, Default)]
struct RateLimitEntry {
    failures: VecDeque<Instant>,
    blocked_until: Option<Instant>,
    // Set once the entry is removed from the map; holders must look it up again.
    retired: bool,
}

impl RateLimitEntry {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Remaining block time, clearing an expired block
    fn remaining_block(&mut self, now: Instant) -> Option<Duration> {
        match self.blocked_until {
            Some(until) if now < until => Some(until - now),
            Some(_) => {
                self.blocked_until = None;
                self.failures.clear();
                None
            }
            None => None,
        }
    }

    fn is_idle(&self) -> bool {
        self.failures.is_empty() && self.blocked_until.is_none()
    }
}

/// Per-(identity, resource) sliding-window failure tracker
pub struct RateLimiter {
    config: RateLimitConfig,
    entries: Mutex<HashMap<Key, Arc<Mutex<RateLimitEntry>>>>,
    metrics: Arc<MetricsRegistry>,
}

impl RateLimiter {
    /// Create a rate limiter
    pub fn new(config: RateLimitConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Rate limiter configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Record a failed attempt, blocking the pair once the window fills up
    ///
    /// Returns the block duration when this failure triggered a block.
    pub fn record_failure(&self, identity: &str, resource: &str) -> Option<Duration> {
        let config = self.config;
        self.with_entry(identity, resource, true, |entry| {
            let now = Instant::now();
            // An active block is never extended by further failures. An
            // expired one is cleared before this failure is counted.
            if entry.remaining_block(now).is_some() {
                return None;
            }
            entry.prune(now, config.window);
            entry.failures.push_back(now);

            if entry.failures.len() as u32 >= config.max_failures {
                entry.blocked_until = Some(now + config.block_duration);
                self.metrics.api_rate_limit_blocks.inc();
                tracing::warn!(
                    identity,
                    resource,
                    failures = entry.failures.len(),
                    block_secs = config.block_duration.as_secs(),
                    "Rate limit block triggered"
                );
                Some(config.block_duration)
            } else {
                tracing::debug!(
                    identity,
                    resource,
                    failures = entry.failures.len(),
                    "Recorded failed attempt"
                );
                None
            }
        })
        .flatten()
    }

    /// Clear every recorded failure and any block for the pair
    pub fn record_success(&self, identity: &str, resource: &str) {
        let key = (identity.to_string(), resource.to_string());
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.remove(&key) {
            let mut entry = entry.lock();
            entry.retired = true;
            if !entry.is_idle() {
                tracing::debug!(identity, resource, "Rate limit state cleared");
            }
        }
    }

    /// Remaining block time if the pair is currently blocked
    pub fn is_blocked(&self, identity: &str, resource: &str) -> Option<Duration> {
        let window = self.config.window;
        self.with_entry(identity, resource, false, |entry| {
            let now = Instant::now();
            entry.prune(now, window);
            entry.remaining_block(now)
        })
        .flatten()
    }

    /// Reject the request with [`Error::RateLimited`] if the pair is blocked
    pub fn check(&self, identity: &str, resource: &str) -> Result<()> {
        match self.is_blocked(identity, resource) {
            Some(remaining) => {
                self.metrics.api_rate_limit_hits.inc();
                Err(Error::RateLimited {
                    retry_after_secs: retry_after_secs(remaining),
                })
            }
            None => Ok(()),
        }
    }

    /// Failures currently counted for the pair
    pub fn failure_count(&self, identity: &str, resource: &str) -> usize {
        let window = self.config.window;
        self.with_entry(identity, resource, false, |entry| {
            entry.prune(Instant::now(), window);
            entry.failures.len()
        })
        .unwrap_or(0)
    }

    /// Number of tracked pairs
    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().len()
    }

    /// Drop pairs that no longer hold failures or a block
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            let mut entry = entry.lock();
            entry.prune(now, self.config.window);
            entry.remaining_block(now);
            if entry.is_idle() {
                entry.retired = true;
                false
            } else {
                true
            }
        });
        self.metrics.api_rate_limit_tracked_pairs.set(entries.len() as i64);
        before - entries.len()
    }

    /// Run `f` under the pair's own lock
    fn with_entry<T>(
        &self,
        identity: &str,
        resource: &str,
        create: bool,
        mut f: impl FnMut(&mut RateLimitEntry) -> T,
    ) -> Option<T> {
        let key = (identity.to_string(), resource.to_string());
        loop {
            let entry = {
                let mut entries = self.entries.lock();
                match entries.get(&key) {
                    Some(entry) => entry.clone(),
                    None if create => entries.entry(key.clone()).or_default().clone(),
                    None => return None,
                }
            };

            let mut guard = entry.lock();
            if guard.retired {
                continue;
            }
            return Some(f(&mut guard));
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("tracked_keys", &self.tracked_keys())
            .finish()
    }
}

/// Whole seconds to advertise in `Retry-After`, rounded up
pub fn retry_after_secs(remaining: Duration) -> u64 {
    let secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig::new(5, Duration::from_secs(60), Duration::from_secs(300)),
            Arc::new(MetricsRegistry::new().unwrap()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_after_max_failures_in_window() {
        let limiter = limiter();

        for _ in 0..4 {
            assert!(limiter.record_failure("10.0.0.1", "photos").is_none());
            tokio::time::advance(Duration::from_secs(2)).await;
        }
        assert!(limiter.is_blocked("10.0.0.1", "photos").is_none());

        assert_eq!(
            limiter.record_failure("10.0.0.1", "photos"),
            Some(Duration::from_secs(300))
        );
        assert_eq!(
            limiter.is_blocked("10.0.0.1", "photos"),
            Some(Duration::from_secs(300))
        );
        assert_eq!(limiter.metrics.api_rate_limit_blocks.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let limiter = limiter();

        for _ in 0..4 {
            limiter.record_failure("a", "c");
            tokio::time::advance(Duration::from_secs(15)).await;
        }
        // t = 60: the first failure has left the window
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.record_failure("a", "c").is_none());
        assert_eq!(limiter.failure_count("a", "c"), 4);
        assert!(limiter.is_blocked("a", "c").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_expires_lazily() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter.record_failure("a", "c");
        }

        tokio::time::advance(Duration::from_secs(250)).await;
        assert_eq!(limiter.is_blocked("a", "c"), Some(Duration::from_secs(50)));

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(limiter.is_blocked("a", "c").is_none());
        assert_eq!(limiter.failure_count("a", "c"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_block_expiry_is_counted() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter.record_failure("a", "c");
        }
        tokio::time::advance(Duration::from_secs(301)).await;

        assert!(limiter.record_failure("a", "c").is_none());
        assert_eq!(limiter.failure_count("a", "c"), 1);

        // Four more make five, which blocks again
        for _ in 0..3 {
            assert!(limiter.record_failure("a", "c").is_none());
        }
        assert_eq!(
            limiter.record_failure("a", "c"),
            Some(Duration::from_secs(300))
        );
        assert_eq!(limiter.metrics.api_rate_limit_blocks.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_failures_and_block() {
        let limiter = limiter();
        for _ in 0..4 {
            limiter.record_failure("a", "c");
        }
        limiter.record_success("a", "c");
        assert_eq!(limiter.failure_count("a", "c"), 0);

        for _ in 0..5 {
            limiter.record_failure("a", "c");
        }
        assert!(limiter.is_blocked("a", "c").is_some());
        limiter.record_success("a", "c");
        assert!(limiter.is_blocked("a", "c").is_none());
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter.record_failure("attacker", "c");
        }
        assert!(limiter.is_blocked("attacker", "c").is_some());
        assert!(limiter.is_blocked("attacker", "other").is_none());
        assert!(limiter.is_blocked("friend", "c").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_is_not_extended() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter.record_failure("a", "c");
        }
        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(limiter.record_failure("a", "c").is_none());
        assert_eq!(limiter.is_blocked("a", "c"), Some(Duration::from_secs(200)));
        assert_eq!(limiter.metrics.api_rate_limit_blocks.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_counts_rejections() {
        let limiter = limiter();
        assert!(limiter.check("a", "c").is_ok());
        for _ in 0..5 {
            limiter.record_failure("a", "c");
        }
        tokio::time::advance(Duration::from_millis(500)).await;

        match limiter.check("a", "c") {
            Err(Error::RateLimited { retry_after_secs }) => assert_eq!(retry_after_secs, 300),
            other => panic!("expected rate limit, got {:?}", other),
        }
        assert_eq!(limiter.metrics.api_rate_limit_hits.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_idle() {
        let limiter = limiter();
        limiter.record_failure("a", "c");
        limiter.record_failure("b", "c");
        assert_eq!(limiter.tracked_keys(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.prune_idle(), 2);
        assert_eq!(limiter.tracked_keys(), 0);

        // Pruned keys start over
        limiter.record_failure("a", "c");
        assert_eq!(limiter.failure_count("a", "c"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_idle_bounds_many_identities() {
        let limiter = limiter();
        for i in 0..10_000 {
            limiter.record_failure(&format!("198.51.{}.{}", i / 256, i % 256), "c");
        }
        for _ in 0..5 {
            limiter.record_failure("blocked", "c");
        }
        assert_eq!(limiter.tracked_keys(), 10_001);

        // Failures have left the window but the block is still active
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.prune_idle(), 10_000);
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.metrics.api_rate_limit_tracked_pairs.get(), 1);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(limiter.prune_idle(), 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_secs(300)), 300);
        assert_eq!(retry_after_secs(Duration::from_millis(299_001)), 300);
        assert_eq!(retry_after_secs(Duration::ZERO), 0);
    }
}
