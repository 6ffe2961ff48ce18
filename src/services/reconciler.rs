//! Consistency Reconciler
//!
//! Read-only three-way comparison of the watched filesystem, the database
//! and the object store:
//!
//! - **pending**: on disk, no ready database record (files mid-ingestion excluded)
//! - **orphaned**: in the sampled object listing, no ready database record
//! - **missing**: sampled database record whose object is absent
//!
//! The object store is only sampled. Up to `sample_size` keys are listed per
//! collection, and up to `sample_size` records are picked at an even stride
//! over the name-ordered records. A sampled record whose key was not in the
//! listing is point-checked with `exists` before it is reported missing.
//!
//! When the object store is unreachable (or its breaker is open) the
//! store-derived fields of that run are `None` (unknown) instead of failing
//! the run. The reconciler never writes to any store.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{Error, Result, StorageError};
use crate::ingest::InFlight;
use crate::observability::MetricsRegistry;
use crate::storage::{object_key, Database, Filesystem, ObjectStore};

use super::framework::ServiceError;
use super::health::ComponentStatus;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Keys listed and records verified per collection
    pub sample_size: usize,

    /// Pending files above which the run is reported Degraded
    pub backlog_threshold: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sample_size: 5,
            backlog_threshold: 10,
        }
    }
}

// ============================================================================
// Report
// ============================================================================

/// A sampled record that could not be verified
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationFailure {
    /// Object store key
    pub object_key: String,
    /// Why verification failed
    pub reason: String,
}

/// Divergences found by one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyFindings {
    /// Collections compared
    pub collections_checked: usize,

    /// `collection/name` on disk without a database record
    pub pending: Vec<String>,

    /// Sampled object keys without a database record; `None` if unknown
    pub orphaned: Option<Vec<String>>,

    /// Sampled database records whose object is absent; `None` if unknown
    pub missing: Option<Vec<String>>,

    /// Sampled records whose existence check failed
    pub verification_failures: Vec<VerificationFailure>,
}

/// Outcome of one reconciliation run
#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    /// Monotonic run number
    pub generation: u64,

    /// What was found
    #[serde(flatten)]
    pub findings: ConsistencyFindings,

    /// When the run finished
    pub timestamp: DateTime<Utc>,

    /// Run duration
    pub duration_ms: f64,
}

impl ConsistencyReport {
    /// Number of pending files
    pub fn pending_count(&self) -> usize {
        self.findings.pending.len()
    }

    /// Number of missing objects (zero when unknown)
    pub fn missing_count(&self) -> usize {
        self.findings.missing.as_ref().map_or(0, Vec::len)
    }

    /// Number of orphaned objects (zero when unknown)
    pub fn orphaned_count(&self) -> usize {
        self.findings.orphaned.as_ref().map_or(0, Vec::len)
    }

    /// Whether the object store could not be consulted
    pub fn store_unknown(&self) -> bool {
        self.findings.orphaned.is_none() || self.findings.missing.is_none()
    }

    /// Health status and message for this report
    ///
    /// Missing objects mean possible data loss (Down); a backlog above the
    /// threshold is Degraded; an unreachable object store is Unknown.
    pub fn assess(&self, backlog_threshold: usize) -> (ComponentStatus, String) {
        let pending = self.pending_count();
        let missing = self.missing_count();

        if missing > 0 {
            (
                ComponentStatus::Down,
                format!("Data integrity issue: {} objects in database but missing from object store", missing),
            )
        } else if pending > backlog_threshold {
            (
                ComponentStatus::Degraded,
                format!("High sync backlog: {} files pending", pending),
            )
        } else if self.store_unknown() {
            (
                ComponentStatus::Unknown,
                "Object store unavailable, store-derived checks skipped".to_string(),
            )
        } else if pending > 0 {
            (
                ComponentStatus::Up,
                format!("Minor sync backlog: {} files pending", pending),
            )
        } else {
            (ComponentStatus::Up, "Data consistent".to_string())
        }
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Periodic, read-only divergence detector
pub struct ConsistencyReconciler {
    config: ReconcilerConfig,
    fs: Arc<dyn Filesystem>,
    db: Arc<dyn Database>,
    store: Arc<dyn ObjectStore>,
    in_flight: Arc<InFlight>,
    generation: AtomicU64,
    last: RwLock<Option<Arc<ConsistencyReport>>>,
    metrics: Arc<MetricsRegistry>,
}

/// Per-run accumulator for store availability
#[derive(Default)]
struct StoreProbe {
    list_unknown: bool,
    exists_unknown: bool,
}

impl ConsistencyReconciler {
    /// Create a reconciler
    ///
    /// `store` should be the guarded store so every access goes through a
    /// circuit breaker.
    pub fn new(
        config: ReconcilerConfig,
        fs: Arc<dyn Filesystem>,
        db: Arc<dyn Database>,
        store: Arc<dyn ObjectStore>,
        in_flight: Arc<InFlight>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            fs,
            db,
            store,
            in_flight,
            generation: AtomicU64::new(0),
            last: RwLock::new(None),
            metrics,
        }
    }

    /// Reconciler configuration
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Most recent published report
    pub fn last_report(&self) -> Option<Arc<ConsistencyReport>> {
        self.last.read().clone()
    }

    /// Run one comparison and publish its report
    ///
    /// Database and filesystem failures fail the run. Object store failures
    /// only make the store-derived fields unknown.
    pub async fn reconcile(&self) -> Result<Arc<ConsistencyReport>> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();

        let findings = self.compare().await?;
        let report = Arc::new(ConsistencyReport {
            generation,
            findings,
            timestamp: Utc::now(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        });

        self.publish(report.clone());
        Ok(report)
    }

    /// Run [`reconcile`](Self::reconcile) in its own task, waiting at most `timeout`
    ///
    /// A run that times out keeps going in the background; its report is
    /// published only if no newer run has published first.
    pub async fn reconcile_within(self: &Arc<Self>, timeout: Duration) -> Result<Arc<ConsistencyReport>> {
        let reconciler = self.clone();
        let run = tokio::spawn(async move { reconciler.reconcile().await });

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                tracing::error!(error = %join_err, "Reconciliation task aborted");
                Err(ServiceError::Panicked("consistency reconciliation".to_string()).into())
            }
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs_f64(), "Reconciliation run timed out");
                Err(Error::timeout("consistency reconciliation", timeout))
            }
        }
    }

    fn publish(&self, report: Arc<ConsistencyReport>) {
        {
            let mut last = self.last.write();
            if let Some(current) = last.as_ref() {
                if current.generation >= report.generation {
                    tracing::debug!(
                        generation = report.generation,
                        current = current.generation,
                        "Discarding superseded reconciliation report"
                    );
                    return;
                }
            }
            *last = Some(report.clone());
        }

        let pending = report.pending_count();
        let missing = report.missing_count();
        let orphaned = report.orphaned_count();

        self.metrics.consistency_checks.inc();
        self.metrics.consistency_pending_files.set(pending as i64);
        self.metrics.consistency_missing_objects.set(missing as i64);
        self.metrics.consistency_orphaned_objects.set(orphaned as i64);
        self.metrics
            .consistency_errors_found
            .inc_by((pending + missing + orphaned) as u64);
        self.metrics
            .consistency_run_duration
            .observe(report.duration_ms / 1000.0);

        if missing > 0 {
            tracing::error!(
                missing,
                keys = ?report.findings.missing,
                "Objects recorded in database are missing from object store"
            );
        } else if pending > self.config.backlog_threshold {
            tracing::warn!(pending, threshold = self.config.backlog_threshold, "Ingestion backlog above threshold");
        } else {
            tracing::debug!(
                generation = report.generation,
                pending,
                orphaned,
                unknown = report.store_unknown(),
                "Reconciliation complete"
            );
        }
    }

    async fn compare(&self) -> Result<ConsistencyFindings> {
        let mut collections: BTreeSet<String> = self.db.list_collections().await?.into_iter().collect();
        collections.extend(self.fs.list_collections().await?);

        let mut findings = ConsistencyFindings {
            collections_checked: collections.len(),
            orphaned: Some(Vec::new()),
            missing: Some(Vec::new()),
            ..Default::default()
        };
        let mut probe = StoreProbe::default();

        for collection in &collections {
            self.compare_collection(collection, &mut findings, &mut probe)
                .await?;
        }

        if probe.list_unknown {
            findings.orphaned = None;
        }
        if probe.exists_unknown {
            findings.missing = None;
        }
        Ok(findings)
    }

    async fn compare_collection(
        &self,
        collection: &str,
        findings: &mut ConsistencyFindings,
        probe: &mut StoreProbe,
    ) -> Result<()> {
        let on_disk = match self.fs.list_entries(collection).await {
            Ok(entries) => entries,
            Err(Error::Storage(StorageError::NotFound(_))) => Vec::new(),
            Err(e) => return Err(e),
        };
        let records = self.db.list_ready_objects(collection).await?;
        let recorded: HashSet<&str> = records.iter().map(|r| r.name.as_str()).collect();

        findings.pending.extend(
            on_disk
                .iter()
                .filter(|name| !recorded.contains(name.as_str()))
                .filter(|name| !self.in_flight.contains(collection, name))
                .map(|name| object_key(collection, name)),
        );

        // Nothing below here may fail the run.
        let prefix = format!("{}/", collection);
        let listed: HashSet<String> = if probe.list_unknown {
            HashSet::new()
        } else {
            match self.store.list_sample(&prefix, self.config.sample_size).await {
                Ok(keys) => keys.into_iter().collect(),
                Err(e) => {
                    tracing::warn!(collection, error = %e, "Object store listing unavailable");
                    probe.list_unknown = true;
                    HashSet::new()
                }
            }
        };

        if let Some(orphaned) = findings.orphaned.as_mut() {
            let mut found: Vec<String> = listed
                .iter()
                .filter(|key| {
                    key.strip_prefix(&prefix)
                        .is_some_and(|name| !recorded.contains(name))
                })
                .cloned()
                .collect();
            found.sort();
            orphaned.extend(found);
        }

        if probe.exists_unknown {
            return Ok(());
        }
        for record in sample_evenly(&records, self.config.sample_size) {
            if listed.contains(&record.object_key) {
                continue;
            }
            match self.store.exists(&record.object_key).await {
                Ok(true) => {}
                Ok(false) => {
                    if let Some(missing) = findings.missing.as_mut() {
                        missing.push(record.object_key.clone());
                    }
                }
                Err(e) if e.is_rejection() => {
                    tracing::warn!(collection, error = %e, "Object store point checks unavailable");
                    probe.exists_unknown = true;
                    return Ok(());
                }
                Err(e) => findings.verification_failures.push(VerificationFailure {
                    object_key: record.object_key.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for ConsistencyReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyReconciler")
            .field("config", &self.config)
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}

/// Up to `n` items at an even stride, always starting with the first
fn sample_evenly<T>(items: &[T], n: usize) -> Vec<&T> {
    if items.len() <= n {
        return items.iter().collect();
    }
    (0..n).map(|i| &items[i * items.len() / n]).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitBreakerConfig;
    use crate::storage::memory::StoredObject;
    use crate::storage::{GuardedObjectStore, LocalFilesystem, MemoryDatabase, MemoryObjectStore, ObjectRecord};
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        fs: Arc<LocalFilesystem>,
        db: Arc<MemoryDatabase>,
        store: Arc<MemoryObjectStore>,
        in_flight: Arc<InFlight>,
        metrics: Arc<MetricsRegistry>,
        reconciler: Arc<ConsistencyReconciler>,
    }

    async fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let fs = Arc::new(LocalFilesystem::new(temp_dir.path()).await.unwrap());
        let db = Arc::new(MemoryDatabase::new());
        let store = Arc::new(MemoryObjectStore::new());
        let in_flight = InFlight::new();
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let guarded = Arc::new(GuardedObjectStore::new(
            store.clone(),
            CircuitBreakerConfig::new(2, 1, Duration::from_secs(30)),
            metrics.clone(),
        ));
        let reconciler = Arc::new(ConsistencyReconciler::new(
            ReconcilerConfig {
                sample_size: 5,
                backlog_threshold: 2,
            },
            fs.clone(),
            db.clone(),
            guarded,
            in_flight.clone(),
            metrics.clone(),
        ));
        Fixture {
            _temp_dir: temp_dir,
            fs,
            db,
            store,
            in_flight,
            metrics,
            reconciler,
        }
    }

    impl Fixture {
        /// File on disk, record in database and object in store
        async fn ingested(&self, collection: &str, name: &str) {
            self.on_disk(collection, name).await;
            self.recorded(collection, name).await;
            self.stored(collection, name);
        }

        async fn on_disk(&self, collection: &str, name: &str) {
            let dir = self.fs.collection_path(collection);
            tokio::fs::create_dir_all(&dir).await.unwrap();
            tokio::fs::write(dir.join(name), name.as_bytes()).await.unwrap();
        }

        async fn recorded(&self, collection: &str, name: &str) {
            if self.db.ensure_collection(collection).await.is_err() {
                return;
            }
            self.db
                .upsert_object(ObjectRecord::ready(collection, name, "00".repeat(32), 1))
                .await
                .unwrap();
        }

        fn stored(&self, collection: &str, name: &str) {
            self.store.put(
                &object_key(collection, name),
                StoredObject {
                    size_bytes: 1,
                    sha256: "00".repeat(32),
                },
            );
        }
    }

    #[tokio::test]
    async fn test_consistent_state() {
        let f = fixture().await;
        f.ingested("docs", "a.txt").await;
        f.ingested("docs", "b.txt").await;

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.findings.collections_checked, 1);
        assert!(report.findings.pending.is_empty());
        assert_eq!(report.findings.orphaned, Some(vec![]));
        assert_eq!(report.findings.missing, Some(vec![]));
        assert_eq!(report.assess(2).0, ComponentStatus::Up);
        assert_eq!(f.metrics.consistency_checks.get(), 1);
    }

    #[tokio::test]
    async fn test_pending_file_only_in_pending() {
        let f = fixture().await;
        f.ingested("docs", "a.txt").await;
        f.on_disk("docs", "new.txt").await;

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.findings.pending, vec!["docs/new.txt"]);
        assert_eq!(report.findings.orphaned, Some(vec![]));
        assert_eq!(report.findings.missing, Some(vec![]));
        assert_eq!(report.assess(2).0, ComponentStatus::Up);
        assert_eq!(f.metrics.consistency_pending_files.get(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_files_are_not_pending() {
        let f = fixture().await;
        f.on_disk("docs", "uploading.bin").await;

        let guard = f.in_flight.enter("docs", "uploading.bin");
        let report = f.reconciler.reconcile().await.unwrap();
        assert!(report.findings.pending.is_empty());

        drop(guard);
        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.findings.pending, vec!["docs/uploading.bin"]);
    }

    #[tokio::test]
    async fn test_missing_object_detected() {
        let f = fixture().await;
        f.ingested("docs", "a.txt").await;
        f.on_disk("docs", "lost.txt").await;
        f.recorded("docs", "lost.txt").await;

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.findings.missing, Some(vec!["docs/lost.txt".to_string()]));
        assert!(report.findings.pending.is_empty());
        assert_eq!(report.assess(2).0, ComponentStatus::Down);
        assert_eq!(f.metrics.consistency_missing_objects.get(), 1);
    }

    #[tokio::test]
    async fn test_orphaned_object_detected() {
        let f = fixture().await;
        f.ingested("docs", "a.txt").await;
        f.stored("docs", "ghost.txt");

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.findings.orphaned, Some(vec!["docs/ghost.txt".to_string()]));
        assert!(report.findings.pending.is_empty());
        assert_eq!(report.findings.missing, Some(vec![]));
    }

    #[tokio::test]
    async fn test_sampled_miss_is_point_checked() {
        let f = fixture().await;
        // More stored objects than the listing sample, so most records are
        // verified by point check rather than by the listing.
        for i in 0..12 {
            f.ingested("docs", &format!("f{:02}.txt", i)).await;
        }

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.findings.missing, Some(vec![]));
        assert!(report.findings.verification_failures.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let f = fixture().await;
        for i in 0..8 {
            f.ingested("docs", &format!("f{}.txt", i)).await;
        }
        f.on_disk("docs", "pending.txt").await;
        f.recorded("photos", "lost.jpg").await;
        f.stored("docs", "orphan.txt");

        let first = f.reconciler.reconcile().await.unwrap();
        let second = f.reconciler.reconcile().await.unwrap();
        assert_eq!(first.findings, second.findings);
        assert_eq!(second.generation, first.generation + 1);
        assert_eq!(f.reconciler.last_report().unwrap().generation, second.generation);
    }

    #[tokio::test]
    async fn test_backlog_threshold_degrades() {
        let f = fixture().await;
        for i in 0..3 {
            f.on_disk("docs", &format!("p{}.txt", i)).await;
        }
        let report = f.reconciler.reconcile().await.unwrap();
        let (status, message) = report.assess(2);
        assert_eq!(status, ComponentStatus::Degraded);
        assert!(message.contains("3 files pending"));
    }

    #[tokio::test]
    async fn test_store_outage_makes_fields_unknown() {
        let f = fixture().await;
        f.ingested("docs", "a.txt").await;
        f.on_disk("docs", "pending.txt").await;
        f.store.set_failing(true);

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.findings.pending, vec!["docs/pending.txt"]);
        assert_eq!(report.findings.orphaned, None);
        assert!(report.store_unknown());
        assert_eq!(report.assess(2).0, ComponentStatus::Unknown);
        assert_eq!(report.findings.verification_failures.len(), 1);
        assert_eq!(report.findings.verification_failures[0].object_key, "docs/a.txt");

        // Second failure opens both breakers; after that calls are rejected
        f.reconciler.reconcile().await.unwrap();
        let calls = f.store.call_count();
        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(f.store.call_count(), calls);
        assert!(report.findings.verification_failures.is_empty());
        assert_eq!(report.findings.missing, None);
        assert_eq!(report.findings.orphaned, None);
    }

    #[tokio::test]
    async fn test_database_failure_fails_run() {
        let f = fixture().await;
        f.db.set_failing(true);
        assert!(f.reconciler.reconcile().await.is_err());
        assert!(f.reconciler.last_report().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_straggler_report_is_discarded() {
        let f = fixture().await;
        f.ingested("docs", "a.txt").await;

        f.store.set_latency(Duration::from_secs(10));
        let err = f
            .reconciler
            .reconcile_within(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));

        // A newer run publishes first
        f.store.set_latency(Duration::ZERO);
        let fresh = f.reconciler.reconcile().await.unwrap();
        assert_eq!(fresh.generation, 2);

        // Let the timed-out run finish; it must not replace the newer report
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.reconciler.last_report().unwrap().generation, 2);
    }

    #[test]
    fn test_sample_evenly() {
        let items: Vec<u32> = (0..10).collect();
        assert_eq!(sample_evenly(&items, 5), vec![&0, &2, &4, &6, &8]);
        assert_eq!(sample_evenly(&items[..3], 5).len(), 3);
        assert!(sample_evenly::<u32>(&[], 5).is_empty());
    }
}
