//! Bounded-parallelism admission control and event debouncing
//!
//! The ingestion pipeline pushes every filesystem event through a
//! [`Debouncer`] keyed by path, and each surviving event must obtain an
//! [`AdmissionTicket`] from the [`ConcurrencyGate`] before touching the
//! database or object store.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};
use crate::observability::MetricsRegistry;
use crate::services::framework::ServiceError;

// ============================================================================
// Concurrency gate
// ============================================================================

/// Bounded pool of admission slots
pub struct ConcurrencyGate {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    in_progress: Arc<AtomicUsize>,
    waiting: AtomicUsize,
    metrics: Arc<MetricsRegistry>,
}

/// One held admission slot, returned to the gate when dropped
#[must_use = "dropping the ticket releases the slot immediately"]
pub struct AdmissionTicket {
    token: String,
    in_progress: Arc<AtomicUsize>,
    metrics: Arc<MetricsRegistry>,
    _permit: OwnedSemaphorePermit,
}

impl AdmissionTicket {
    /// Token the slot was admitted for
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.in_progress.fetch_sub(1, Ordering::SeqCst);
        self.metrics.watcher_files_in_progress.dec();
    }
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("token", &self.token)
            .finish()
    }
}

/// Decrements the queue depth even if the waiting caller is cancelled
struct WaitingGuard<'a> {
    gate: &'a ConcurrencyGate,
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.gate.waiting.fetch_sub(1, Ordering::SeqCst);
        self.gate.metrics.watcher_queue_depth.dec();
    }
}

impl ConcurrencyGate {
    /// Create a gate with `capacity` slots
    pub fn new(capacity: usize, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            in_progress: Arc::new(AtomicUsize::new(0)),
            waiting: AtomicUsize::new(0),
            metrics,
        }
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held
    pub fn in_progress(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Callers currently waiting for a slot
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for a free slot
    ///
    /// On timeout the attempt is abandoned: it fails with [`Error::Timeout`]
    /// and holds no slot.
    pub async fn admit(&self, token: impl Into<String>, timeout: Duration) -> Result<AdmissionTicket> {
        let token = token.into();

        self.waiting.fetch_add(1, Ordering::SeqCst);
        self.metrics.watcher_queue_depth.inc();
        let acquired = {
            let _waiting = WaitingGuard { gate: self };
            tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned()).await
        };

        match acquired {
            Ok(Ok(permit)) => {
                self.in_progress.fetch_add(1, Ordering::SeqCst);
                self.metrics.watcher_files_in_progress.inc();
                tracing::trace!(token = %token, "Admission granted");
                Ok(AdmissionTicket {
                    token,
                    in_progress: self.in_progress.clone(),
                    metrics: self.metrics.clone(),
                    _permit: permit,
                })
            }
            Ok(Err(_)) => Err(ServiceError::failed("concurrency_gate", "gate closed").into()),
            Err(_) => {
                self.metrics.watcher_admission_timeouts.inc();
                tracing::warn!(
                    token = %token,
                    timeout_secs = timeout.as_secs_f64(),
                    "Admission timed out, abandoning"
                );
                Err(Error::timeout(format!("admission of {}", token), timeout))
            }
        }
    }

    /// Return a slot to the gate
    pub fn release(&self, ticket: AdmissionTicket) {
        tracing::trace!(token = %ticket.token, "Admission released");
        drop(ticket);
    }

    /// Fail every current and future `admit` call
    pub fn close(&self) {
        self.semaphore.close();
    }
}

impl std::fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyGate")
            .field("capacity", &self.capacity)
            .field("in_progress", &self.in_progress())
            .field("waiting", &self.waiting())
            .finish()
    }
}

// ============================================================================
// Debouncer
// ============================================================================

/// Trailing-edge debouncer
///
/// Each submitted value is emitted on the output channel after `delay`
/// unless a newer value for the same key arrives first, in which case the
/// older value is discarded. Must be used from within a Tokio runtime.
pub struct Debouncer<K, V> {
    delay: Duration,
    pending: Arc<Mutex<HashMap<K, u64>>>,
    next_generation: AtomicU64,
    tx: mpsc::UnboundedSender<(K, V)>,
    metrics: Arc<MetricsRegistry>,
}

impl<K, V> Debouncer<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    /// Create a debouncer and the receiver its settled values are sent to
    pub fn new(delay: Duration, metrics: Arc<MetricsRegistry>) -> (Self, mpsc::UnboundedReceiver<(K, V)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let debouncer = Self {
            delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            tx,
            metrics,
        };
        (debouncer, rx)
    }

    /// Submit a value, superseding any pending value for the same key
    pub fn submit(&self, key: K, value: V) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        if self.pending.lock().insert(key.clone(), generation).is_some() {
            self.metrics.watcher_events_debounced.inc();
        }

        let deadline = tokio::time::Instant::now() + self.delay;
        let pending = self.pending.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let settled = {
                let mut pending = pending.lock();
                if pending.get(&key) == Some(&generation) {
                    pending.remove(&key);
                    true
                } else {
                    false
                }
            };
            if settled {
                let _ = tx.send((key, value));
            }
        });
    }

    /// Keys waiting for their debounce delay to pass
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

// ============================================================================
// Tests
// ============================================================================
