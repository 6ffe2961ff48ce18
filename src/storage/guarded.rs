//! Circuit-breaker-guarded object store
//!
//! Each operation family (`upload`, `delete`, `exists`, `list`, `get`) has its
//! own breaker, so a failing upload path does not block existence checks made
//! by the reconciler. `bucket_exists` shares the `exists` breaker.
//!
//! Only failures of the store itself count against a breaker. A source file
//! that cannot be read (`Error::Io`) or an object that does not exist
//! (`StorageError::NotFound`) is the caller's problem and passes through
//! without being recorded.

use std::path::Path;
use std::sync::Arc;

use tokio::time::Instant;

use super::{ObjectReader, ObjectStore};
use crate::error::{Error, Result, StorageError};
use crate::observability::MetricsRegistry;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus};

/// Operation families with their own breaker
pub const OPERATIONS: [&str; 5] = ["upload", "delete", "exists", "list", "get"];

/// [`ObjectStore`] wrapper routing every call through a breaker
pub struct GuardedObjectStore {
    inner: Arc<dyn ObjectStore>,
    upload: CircuitBreaker,
    delete: CircuitBreaker,
    exists: CircuitBreaker,
    list: CircuitBreaker,
    get: CircuitBreaker,
    metrics: Arc<MetricsRegistry>,
}

/// Whether an error says something about the store rather than the caller
fn is_store_failure(error: &Error) -> bool {
    !matches!(error, Error::Io(_) | Error::Storage(StorageError::NotFound(_)))
}

impl GuardedObjectStore {
    /// Wrap `inner`, creating one breaker per operation family with `config`
    pub fn new(
        inner: Arc<dyn ObjectStore>,
        config: CircuitBreakerConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let breaker = |op: &str| CircuitBreaker::new(format!("object_store_{}", op), config, metrics.clone());
        Self {
            upload: breaker("upload"),
            delete: breaker("delete"),
            exists: breaker("exists"),
            list: breaker("list"),
            get: breaker("get"),
            inner,
            metrics,
        }
    }

    /// Breaker guarding an operation family
    pub fn breaker(&self, operation: &str) -> Option<&CircuitBreaker> {
        match operation {
            "upload" => Some(&self.upload),
            "delete" => Some(&self.delete),
            "exists" => Some(&self.exists),
            "list" => Some(&self.list),
            "get" => Some(&self.get),
            _ => None,
        }
    }

    /// Status of every breaker
    pub fn breaker_statuses(&self) -> Vec<CircuitBreakerStatus> {
        [&self.upload, &self.delete, &self.exists, &self.list, &self.get]
            .iter()
            .map(|b| b.status())
            .collect()
    }

    async fn guarded<T, F, Fut>(&self, operation: &'static str, breaker: &CircuitBreaker, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let latency = &self.metrics.object_store_latency;
        let result = breaker
            .execute_filtered(
                move || async move {
                    let started = Instant::now();
                    let result = call().await;
                    latency
                        .with_label_values(&[operation])
                        .observe(started.elapsed().as_secs_f64() * 1000.0);
                    result
                },
                is_store_failure,
            )
            .await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) if e.is_rejection() => "rejected",
            Err(e) if !is_store_failure(e) => {
                tracing::debug!(operation, error = %e, "Object store call failed on the caller side");
                "excluded"
            }
            Err(e) => {
                if matches!(e, Error::Connection(_) | Error::Storage(StorageError::ObjectStore(_))) {
                    self.metrics.object_store_connection_errors.inc();
                }
                tracing::warn!(operation, error = %e, "Object store operation failed");
                "error"
            }
        };
        self.metrics
            .object_store_operations
            .with_label_values(&[operation, outcome])
            .inc();

        result
    }
}

#[async_trait::async_trait]
impl ObjectStore for GuardedObjectStore {
    async fn bucket_exists(&self) -> Result<bool> {
        self.guarded("bucket_exists", &self.exists, || self.inner.bucket_exists())
            .await
    }

    async fn upload(&self, key: &str, path: &Path) -> Result<()> {
        self.guarded("upload", &self.upload, || self.inner.upload(key, path))
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.guarded("delete", &self.delete, || self.inner.delete(key))
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.guarded("exists", &self.exists, || self.inner.exists(key))
            .await
    }

    async fn list_sample(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        self.guarded("list", &self.list, || self.inner.list_sample(prefix, limit))
            .await
    }

    async fn get(&self, key: &str) -> Result<ObjectReader> {
        self.guarded("get", &self.get, || self.inner.get(key)).await
    }
}

impl std::fmt::Debug for GuardedObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedObjectStore")
            .field("breakers", &self.breaker_statuses())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;
    use crate::storage::MemoryObjectStore;
    use std::time::Duration;

    fn guarded() -> (Arc<MemoryObjectStore>, GuardedObjectStore, Arc<MetricsRegistry>) {
        let inner = Arc::new(MemoryObjectStore::new());
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let store = GuardedObjectStore::new(
            inner.clone(),
            CircuitBreakerConfig::new(5, 2, Duration::from_secs(30)),
            metrics.clone(),
        );
        (inner, store, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_stops_calls_to_failing_store() {
        let (inner, store, metrics) = guarded();
        inner.set_failing(true);

        for _ in 0..5 {
            assert!(matches!(store.delete("a/b").await, Err(Error::Storage(_))));
        }
        assert_eq!(store.breaker("delete").unwrap().state(), CircuitState::Open);

        for _ in 0..10 {
            assert!(matches!(
                store.delete("a/b").await,
                Err(Error::CircuitOpen { .. })
            ));
        }
        assert_eq!(inner.call_count(), 5);

        let ops = |outcome: &str| {
            metrics
                .object_store_operations
                .with_label_values(&["delete", outcome])
                .get()
        };
        assert_eq!(ops("error"), 5);
        assert_eq!(ops("rejected"), 10);
        assert_eq!(metrics.object_store_connection_errors.get(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_families_are_independent() {
        let (inner, store, _metrics) = guarded();
        inner.set_failing(true);
        for _ in 0..5 {
            let _ = store.delete("a/b").await;
        }
        inner.set_failing(false);

        assert!(matches!(
            store.delete("a/b").await,
            Err(Error::CircuitOpen { .. })
        ));
        assert!(!store.exists("a/b").await.unwrap());
        assert!(store.list_sample("a/", 5).await.unwrap().is_empty());
        assert!(store.bucket_exists().await.unwrap());

        let statuses = store.breaker_statuses();
        assert_eq!(statuses.len(), 5);
        assert_eq!(
            statuses
                .iter()
                .filter(|s| s.state == CircuitState::Open)
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_errors_leave_breakers_closed() {
        let (inner, store, metrics) = guarded();
        let temp_dir = tempfile::TempDir::new().unwrap();
        let missing = temp_dir.path().join("vanished.txt");

        for _ in 0..10 {
            assert!(matches!(store.upload("docs/vanished.txt", &missing).await, Err(Error::Io(_))));
            assert!(matches!(
                store.get("docs/absent.txt").await,
                Err(Error::Storage(StorageError::NotFound(_)))
            ));
        }
        assert_eq!(store.breaker("upload").unwrap().state(), CircuitState::Closed);
        assert_eq!(store.breaker("get").unwrap().state(), CircuitState::Closed);
        assert_eq!(inner.call_count(), 20);
        assert_eq!(
            metrics
                .object_store_operations
                .with_label_values(&["upload", "excluded"])
                .get(),
            10
        );
        assert_eq!(metrics.object_store_connection_errors.get(), 0);

        // Store failures on the same path still trip it
        inner.set_failing(true);
        for _ in 0..5 {
            let _ = store.get("docs/absent.txt").await;
        }
        assert_eq!(store.breaker("get").unwrap().state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_timeout() {
        let (inner, store, metrics) = guarded();
        inner.set_failing(true);
        for _ in 0..5 {
            let _ = store.exists("a/b").await;
        }
        inner.set_failing(false);

        tokio::time::advance(Duration::from_secs(30)).await;
        store.exists("a/b").await.unwrap();
        store.exists("a/b").await.unwrap();
        assert_eq!(store.breaker("exists").unwrap().state(), CircuitState::Closed);

        let count = metrics
            .object_store_latency
            .with_label_values(&["exists"])
            .get_sample_count();
        assert_eq!(count, 7);
    }
}
