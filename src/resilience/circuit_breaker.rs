//! Circuit breaker for unreliable external dependencies
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast with [`Error::CircuitOpen`]
//! - Half-Open: a single probe call at a time tests whether it recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open:      failure_count reaches failure_threshold
//! Open → Half-Open:   first call after `timeout` has elapsed
//! Half-Open → Closed: success_threshold consecutive probe successes
//! Half-Open → Open:   any probe failure (failure_count = 1, timer restarted)
//! ```
//!
//! All state lives behind one mutex per breaker, so transitions for a given
//! breaker key are linearized. The lock is never held across the wrapped
//! operation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::observability::MetricsRegistry;

// ============================================================================
// Configuration
// ============================================================================

/// Thresholds for a single breaker instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed that open the circuit
    pub failure_threshold: u32,

    /// Consecutive probe successes in Half-Open that close the circuit
    pub success_threshold: u32,

    /// Time spent Open before a probe is let through
    pub timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Create a breaker configuration
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            timeout,
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected without being invoked
    Open,
    /// One probe call at a time is let through
    HalfOpen,
}

impl CircuitState {
    /// Value reported on the state gauge
    pub fn gauge_value(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    /// Lower-case name used in logs and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    transitioned_at: Instant,
    probe_in_flight: bool,
}

/// Point-in-time view of a breaker for health reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStatus {
    /// Breaker key
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures recorded
    pub failure_count: u32,
    /// Consecutive probe successes recorded (Half-Open only)
    pub success_count: u32,
    /// Seconds until an Open breaker lets a probe through
    pub retry_after_secs: Option<f64>,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Wraps calls to one protected operation family
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    metrics: Arc<MetricsRegistry>,
}

/// Admission granted by the breaker for one call
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        // A probe cancelled mid-flight must not wedge the breaker in Half-Open.
        if self.probe && !self.settled {
            self.breaker.state.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    /// Create a breaker in the Closed state
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let name = name.into();
        metrics
            .circuit_breaker_state
            .with_label_values(&[&name])
            .set(CircuitState::Closed.gauge_value());

        Self {
            name,
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                transitioned_at: Instant::now(),
                probe_in_flight: false,
            }),
            metrics,
        }
    }

    /// Breaker key
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state (an expired Open breaker stays Open until the next call)
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Consecutive failures recorded
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Status snapshot for health reporting
    pub fn status(&self) -> CircuitBreakerStatus {
        let s = self.state.lock();
        let retry_after_secs = (s.state == CircuitState::Open).then(|| {
            self.config
                .timeout
                .saturating_sub(s.transitioned_at.elapsed())
                .as_secs_f64()
        });
        CircuitBreakerStatus {
            name: self.name.clone(),
            state: s.state,
            failure_count: s.failure_count,
            success_count: s.success_count,
            retry_after_secs,
        }
    }

    /// Run `operation` through the breaker
    ///
    /// Returns the operation's own result, or [`Error::CircuitOpen`] without
    /// invoking it when the circuit is open (or a half-open probe is already
    /// in flight).
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_filtered(operation, |_| true).await
    }

    /// Like [`execute`](Self::execute), but only errors for which
    /// `is_failure` returns true are counted against the dependency
    ///
    /// Excluded errors are returned untouched and leave the counters alone.
    /// An excluded half-open probe frees the probe slot without deciding the
    /// state.
    pub async fn execute_filtered<T, F, Fut, P>(&self, operation: F, is_failure: P) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: FnOnce(&Error) -> bool,
    {
        let mut permit = self.acquire()?;

        let outcome = operation().await;

        match &outcome {
            Ok(_) => {
                permit.settled = true;
                self.on_success(permit.probe);
            }
            Err(e) if is_failure(e) => {
                permit.settled = true;
                tracing::debug!(breaker = %self.name, error = %e, "Protected call failed");
                self.on_failure(permit.probe);
            }
            Err(e) => {
                tracing::debug!(breaker = %self.name, error = %e, "Protected call failed with an excluded error");
                self.metrics
                    .circuit_breaker_calls
                    .with_label_values(&[&self.name, "excluded"])
                    .inc();
            }
        }

        outcome
    }

    /// Force the breaker back to Closed
    pub fn reset(&self) {
        let mut s = self.state.lock();
        s.probe_in_flight = false;
        self.transition(&mut s, CircuitState::Closed);
    }

    fn acquire(&self) -> Result<CallPermit<'_>> {
        let mut s = self.state.lock();

        let probe = match s.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = s.transitioned_at.elapsed();
                if elapsed < self.config.timeout {
                    return Err(self.reject(self.config.timeout - elapsed));
                }
                self.transition(&mut s, CircuitState::HalfOpen);
                s.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if s.probe_in_flight {
                    return Err(self.reject(Duration::ZERO));
                }
                s.probe_in_flight = true;
                true
            }
        };

        Ok(CallPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    fn reject(&self, retry_after: Duration) -> Error {
        self.metrics
            .circuit_breaker_calls
            .with_label_values(&[&self.name, "rejected"])
            .inc();
        Error::CircuitOpen {
            name: self.name.clone(),
            retry_after,
        }
    }

    fn on_success(&self, probe: bool) {
        self.metrics
            .circuit_breaker_calls
            .with_label_values(&[&self.name, "success"])
            .inc();

        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => s.failure_count = 0,
            CircuitState::HalfOpen if probe => {
                s.probe_in_flight = false;
                s.success_count += 1;
                if s.success_count >= self.config.success_threshold {
                    self.transition(&mut s, CircuitState::Closed);
                }
            }
            // Straggler from before the last transition
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        self.metrics
            .circuit_breaker_calls
            .with_label_values(&[&self.name, "failure"])
            .inc();

        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => {
                s.failure_count += 1;
                if s.failure_count >= self.config.failure_threshold {
                    self.transition(&mut s, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if probe => {
                s.probe_in_flight = false;
                self.transition(&mut s, CircuitState::Open);
                s.failure_count = 1;
            }
            _ => {}
        }
    }

    fn transition(&self, s: &mut BreakerState, to: CircuitState) {
        let from = s.state;
        s.state = to;
        s.transitioned_at = Instant::now();
        match to {
            CircuitState::Closed => {
                s.failure_count = 0;
                s.success_count = 0;
            }
            CircuitState::HalfOpen => s.success_count = 0,
            CircuitState::Open => s.success_count = 0,
        }

        self.metrics
            .circuit_breaker_state
            .with_label_values(&[&self.name])
            .set(to.gauge_value());
        if from != to {
            self.metrics
                .circuit_breaker_transitions
                .with_label_values(&[&self.name, to.as_str()])
                .inc();
        }

        if to == CircuitState::Open {
            tracing::warn!(
                breaker = %self.name,
                from = from.as_str(),
                failures = s.failure_count,
                timeout_secs = self.config.timeout.as_secs_f64(),
                "Circuit breaker opened"
            );
        } else {
            tracing::info!(
                breaker = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker transition"
            );
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(failures: u32, successes: u32, timeout_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "upload",
            CircuitBreakerConfig::new(failures, successes, Duration::from_secs(timeout_secs)),
            Arc::new(MetricsRegistry::new().unwrap()),
        )
    }

    async fn fail(b: &CircuitBreaker, calls: &AtomicU32) -> Result<()> {
        b.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::ObjectStore("connection refused".to_string()).into())
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker, calls: &AtomicU32) -> Result<u32> {
        b.execute(|| async { Ok(calls.fetch_add(1, Ordering::SeqCst)) })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_failure_threshold() {
        let b = breaker(5, 2, 30);
        let calls = AtomicU32::new(0);

        for i in 0..4 {
            assert!(fail(&b, &calls).await.is_err());
            assert_eq!(b.state(), CircuitState::Closed, "still closed after {}", i + 1);
        }
        assert!(fail(&b, &calls).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);

        // Rejected without invoking the operation
        let err = succeed(&b, &calls).await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let b = breaker(3, 1, 30);
        let calls = AtomicU32::new(0);

        fail(&b, &calls).await.unwrap_err();
        fail(&b, &calls).await.unwrap_err();
        assert_eq!(b.failure_count(), 2);

        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.failure_count(), 0);

        fail(&b, &calls).await.unwrap_err();
        fail(&b, &calls).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout_then_closes() {
        let b = breaker(2, 2, 30);
        let calls = AtomicU32::new(0);

        fail(&b, &calls).await.unwrap_err();
        fail(&b, &calls).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(matches!(
            succeed(&b, &calls).await,
            Err(Error::CircuitOpen { .. })
        ));

        tokio::time::advance(Duration::from_secs(1)).await;
        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);

        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let b = breaker(2, 3, 10);
        let calls = AtomicU32::new(0);

        fail(&b, &calls).await.unwrap_err();
        fail(&b, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(10)).await;

        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);

        fail(&b, &calls).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.failure_count(), 1);

        // Timer restarted at the half-open failure
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(
            succeed(&b, &calls).await,
            Err(Error::CircuitOpen { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_one_probe_at_a_time() {
        let b = Arc::new(breaker(1, 1, 5));
        let calls = AtomicU32::new(0);

        fail(&b, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(5)).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let probe = tokio::spawn({
            let b = b.clone();
            async move {
                b.execute(|| async move {
                    let _ = rx.await;
                    Ok(())
                })
                .await
            }
        });
        tokio::task::yield_now().await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        // Second caller is rejected while the probe is outstanding
        let concurrent = succeed(&b, &calls).await;
        assert!(matches!(concurrent, Err(Error::CircuitOpen { .. })));

        tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_releases_slot() {
        let b = breaker(1, 1, 5);
        let calls = AtomicU32::new(0);

        fail(&b, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(5)).await;

        let stalled = b.execute(|| std::future::pending::<Result<()>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), stalled).await;
        assert!(timed_out.is_err());

        // The abandoned probe does not block the next one
        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_reflect_state() {
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let b = CircuitBreaker::new(
            "delete",
            CircuitBreakerConfig::new(1, 1, Duration::from_secs(5)),
            metrics.clone(),
        );
        let calls = AtomicU32::new(0);
        let gauge = metrics.circuit_breaker_state.with_label_values(&["delete"]);

        assert_eq!(gauge.get(), 0);
        fail(&b, &calls).await.unwrap_err();
        assert_eq!(gauge.get(), 1);
        succeed(&b, &calls).await.unwrap_err();

        let outcome = |o: &str| {
            metrics
                .circuit_breaker_calls
                .with_label_values(&["delete", o])
                .get()
        };
        assert_eq!(outcome("failure"), 1);
        assert_eq!(outcome("rejected"), 1);
        assert_eq!(outcome("success"), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        succeed(&b, &calls).await.unwrap();
        assert_eq!(gauge.get(), 0);
        assert_eq!(outcome("success"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_excluded_errors_do_not_trip() {
        let b = breaker(2, 1, 30);
        let not_found = || async { Err::<(), _>(Error::from(StorageError::NotFound("docs/a.txt".to_string()))) };
        let only_remote = |e: &Error| !matches!(e, Error::Storage(StorageError::NotFound(_)));

        for _ in 0..10 {
            let err = b.execute_filtered(not_found, only_remote).await.unwrap_err();
            assert!(matches!(err, Error::Storage(StorageError::NotFound(_))));
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
        assert_eq!(
            b.metrics
                .circuit_breaker_calls
                .with_label_values(&["upload", "excluded"])
                .get(),
            10
        );

        // An excluded error also leaves an existing failure streak untouched
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await.unwrap_err();
        b.execute_filtered(not_found, only_remote).await.unwrap_err();
        assert_eq!(b.failure_count(), 1);
        fail(&b, &calls).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_excluded_result_frees_half_open_slot() {
        let b = breaker(1, 1, 5);
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(5)).await;

        let excluded = b
            .execute_filtered(|| async { Err::<(), _>(Error::Io(std::io::ErrorKind::NotFound.into())) }, |e| {
                !matches!(e, Error::Io(_))
            })
            .await;
        assert!(matches!(excluded, Err(Error::Io(_))));
        assert_eq!(b.state(), CircuitState::HalfOpen);

        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_and_reset() {
        let b = breaker(1, 1, 30);
        let calls = AtomicU32::new(0);

        fail(&b, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(10)).await;

        let status = b.status();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.retry_after_secs, Some(20.0));

        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.status().retry_after_secs.is_none());
        succeed(&b, &calls).await.unwrap();
    }
}
