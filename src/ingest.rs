//! Ingestion pipeline
//!
//! ```text
//! watcher ──WatchEvent──▶ submit ──▶ Debouncer ──▶ dispatch ──▶ gate.admit
//!                                     (per path)                    │
//!                                                   ┌───────────────┘
//!                                                   ▼
//!                               processing timeout { hash, upload, upsert }
//!                                                or { delete, mark_deleted }
//! ```
//!
//! Object store calls go through the guarded store handed to the pipeline,
//! so a dead object store trips its breaker instead of tying up every slot.
//!
//! Events for one path are applied in order by a single worker task. An event
//! that settles while its path is still being processed waits for that run
//! and collapses with any other waiting event into the latest kind.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::GateSection;
use crate::error::{Error, Result};
use crate::observability::MetricsRegistry;
use crate::resilience::{ConcurrencyGate, Debouncer};
use crate::storage::local::compute_file_hash;
use crate::storage::{object_key, Database, LocalFilesystem, ObjectRecord, ObjectStore};

// ============================================================================
// Events
// ============================================================================

/// What happened to a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEventKind {
    /// File appeared
    Created,
    /// File content changed
    Modified,
    /// File disappeared
    Deleted,
}

/// A filesystem change under the collections root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Absolute path of the file
    pub path: PathBuf,
    /// Change kind
    pub kind: FileEventKind,
}

impl FileEvent {
    /// Build an event
    pub fn new(path: impl Into<PathBuf>, kind: FileEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Messages from the watcher to the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file changed
    File(FileEvent),
    /// A new collection directory appeared
    CollectionCreated(String),
}

// ============================================================================
// In-flight tracking
// ============================================================================

/// Files currently being ingested
///
/// The reconciler subtracts these from its pending set: a file mid-ingestion
/// is not backlog.
#[derive(Debug, Default)]
pub struct InFlight {
    entries: Mutex<HashMap<(String, String), usize>>,
}

/// Marks one file as in flight until dropped
#[derive(Debug)]
pub struct InFlightGuard {
    set: Arc<InFlight>,
    key: (String, String),
}

impl InFlight {
    /// Create an empty set
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark `collection/name` in flight
    pub fn enter(self: &Arc<Self>, collection: &str, name: &str) -> InFlightGuard {
        let key = (collection.to_string(), name.to_string());
        *self.entries.lock().entry(key.clone()).or_insert(0) += 1;
        InFlightGuard {
            set: self.clone(),
            key,
        }
    }

    /// Whether `collection/name` is in flight
    pub fn contains(&self, collection: &str, name: &str) -> bool {
        self.entries
            .lock()
            .contains_key(&(collection.to_string(), name.to_string()))
    }

    /// Number of files in flight
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut entries = self.set.entries.lock();
        if let Some(count) = entries.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                entries.remove(&self.key);
            }
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Pipeline timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestConfig {
    /// Longest an event waits for an admission slot
    pub admission_timeout: Duration,
    /// Longest an admitted event may take to process
    pub processing_timeout: Duration,
    /// Debounce window per path
    pub debounce: Duration,
}

impl From<&GateSection> for IngestConfig {
    fn from(gate: &GateSection) -> Self {
        Self {
            admission_timeout: gate.admission_timeout(),
            processing_timeout: gate.processing_timeout(),
            debounce: gate.debounce(),
        }
    }
}

/// Turns filesystem events into database records and stored objects
pub struct IngestPipeline {
    config: IngestConfig,
    fs: Arc<LocalFilesystem>,
    db: Arc<dyn Database>,
    store: Arc<dyn ObjectStore>,
    gate: Arc<ConcurrencyGate>,
    debouncer: Debouncer<PathBuf, FileEventKind>,
    in_flight: Arc<InFlight>,
    /// Paths with a running worker and the kind queued behind it
    workers: Mutex<HashMap<PathBuf, Option<FileEventKind>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<MetricsRegistry>,
}

impl IngestPipeline {
    /// Create the pipeline and spawn its dispatcher
    ///
    /// `store` should be a guarded store so uploads and deletes pass
    /// through a circuit breaker.
    pub fn new(
        config: IngestConfig,
        fs: Arc<LocalFilesystem>,
        db: Arc<dyn Database>,
        store: Arc<dyn ObjectStore>,
        gate: Arc<ConcurrencyGate>,
        in_flight: Arc<InFlight>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let (debouncer, settled) = Debouncer::new(config.debounce, metrics.clone());
        let pipeline = Arc::new(Self {
            config,
            fs,
            db,
            store,
            gate,
            debouncer,
            in_flight,
            workers: Mutex::new(HashMap::new()),
            dispatcher: Mutex::new(None),
            metrics,
        });

        let handle = tokio::spawn(Self::dispatch(Arc::downgrade(&pipeline), settled));
        *pipeline.dispatcher.lock() = Some(handle);
        pipeline
    }

    /// Files currently being ingested
    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    /// Events waiting out their debounce window
    pub fn debouncing(&self) -> usize {
        self.debouncer.pending()
    }

    /// Queue a file event; events outside the collection layout are dropped
    pub fn submit(&self, event: FileEvent) {
        if self.fs.parse_collection_path(&event.path).is_none() {
            tracing::trace!(path = ?event.path, "Ignoring event outside collection layout");
            return;
        }
        self.debouncer.submit(event.path, event.kind);
    }

    /// Forward watcher messages into the pipeline until the sender closes
    pub fn spawn_event_loop(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<WatchEvent>) -> JoinHandle<()> {
        let pipeline = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(pipeline) = pipeline.upgrade() else {
                    break;
                };
                match event {
                    WatchEvent::File(event) => pipeline.submit(event),
                    WatchEvent::CollectionCreated(name) => {
                        tokio::spawn(async move {
                            if let Err(e) = pipeline.ensure_collection(&name).await {
                                tracing::error!(collection = %name, error = %e, "Failed to create collection");
                            }
                        });
                    }
                }
            }
            tracing::debug!("Watch event loop stopped");
        })
    }

    /// Make sure a collection is registered, writing its key file when new
    pub async fn ensure_collection(&self, collection: &str) -> Result<()> {
        if let Some(api_key) = self.db.ensure_collection(collection).await? {
            let path = self.fs.write_vault_key(collection, &api_key).await?;
            tracing::info!(collection, key_file = ?path, "Created collection");
        }
        Ok(())
    }

    /// Stop dispatching and fail pending admissions
    pub fn shutdown(&self) {
        self.gate.close();
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }

    async fn dispatch(pipeline: Weak<Self>, mut settled: mpsc::UnboundedReceiver<(PathBuf, FileEventKind)>) {
        while let Some((path, kind)) = settled.recv().await {
            let Some(pipeline) = pipeline.upgrade() else {
                break;
            };

            {
                let mut workers = pipeline.workers.lock();
                if let Some(queued) = workers.get_mut(&path) {
                    tracing::trace!(path = ?path, kind = ?kind, "Queued behind running worker");
                    *queued = Some(kind);
                    continue;
                }
                workers.insert(path.clone(), None);
            }
            tokio::spawn(pipeline.run_path(path, kind));
        }
    }

    /// Process events for `path` until nothing is queued behind the last one
    async fn run_path(self: Arc<Self>, path: PathBuf, mut kind: FileEventKind) {
        loop {
            self.process(FileEvent::new(path.clone(), kind)).await;

            let next = {
                let mut workers = self.workers.lock();
                let next = workers.get_mut(&path).and_then(Option::take);
                if next.is_none() {
                    workers.remove(&path);
                }
                next
            };
            match next {
                Some(queued) => kind = queued,
                None => return,
            }
        }
    }

    /// Admit, then apply one debounced event under the processing timeout
    pub async fn process(&self, event: FileEvent) {
        let Some((collection, name)) = self.fs.parse_collection_path(&event.path) else {
            return;
        };
        let _in_flight = self.in_flight.enter(&collection, &name);
        let key = object_key(&collection, &name);

        let ticket = match self.gate.admit(key.clone(), self.config.admission_timeout).await {
            Ok(ticket) => ticket,
            Err(e) => {
                tracing::warn!(object_key = %key, error = %e, "Event abandoned before admission");
                return;
            }
        };

        let outcome = tokio::time::timeout(
            self.config.processing_timeout,
            self.apply(&collection, &name, &event),
        )
        .await
        .unwrap_or_else(|_| Err(Error::timeout(format!("processing {}", key), self.config.processing_timeout)));

        match outcome {
            Ok(()) => {
                self.metrics.watcher_files_processed.inc();
                tracing::debug!(object_key = %key, kind = ?event.kind, "File event processed");
            }
            Err(e) => {
                if matches!(e, Error::Timeout { .. }) {
                    self.metrics.watcher_processing_timeouts.inc();
                }
                self.metrics.watcher_files_failed.inc();
                tracing::error!(object_key = %key, kind = ?event.kind, error = %e, "Failed to process file event");
            }
        }

        self.gate.release(ticket);
    }

    async fn apply(&self, collection: &str, name: &str, event: &FileEvent) -> Result<()> {
        let key = object_key(collection, name);
        match event.kind {
            FileEventKind::Created | FileEventKind::Modified => {
                match tokio::fs::metadata(&event.path).await {
                    Ok(meta) if meta.is_file() => {}
                    // Gone or replaced by a directory since the event fired
                    _ => return Ok(()),
                }

                self.ensure_collection(collection).await?;
                let (sha256, size_bytes) = compute_file_hash(&event.path).await?;
                self.store.upload(&key, &event.path).await?;
                self.db
                    .upsert_object(ObjectRecord::ready(collection, name, sha256, size_bytes))
                    .await?;
                tracing::info!(object_key = %key, size_bytes, "Registered object");
            }
            FileEventKind::Deleted => {
                self.store.delete(&key).await?;
                if self.db.mark_deleted(collection, name).await? {
                    tracing::info!(object_key = %key, "Marked object deleted");
                }
            }
        }
        Ok(())
    }
}

impl Drop for IngestPipeline {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for IngestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("config", &self.config)
            .field("gate", &self.gate)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitBreakerConfig;
    use crate::storage::{Filesystem, GuardedObjectStore, MemoryDatabase, MemoryObjectStore, ObjectStatus};
    use std::path::Path;
    use tempfile::TempDir;

    /// Stores the object, then holds the upload open for `delay`
    struct SlowUploads {
        inner: Arc<MemoryObjectStore>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ObjectStore for SlowUploads {
        async fn bucket_exists(&self) -> Result<bool> {
            self.inner.bucket_exists().await
        }

        async fn upload(&self, key: &str, path: &Path) -> Result<()> {
            self.inner.upload(key, path).await?;
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }

        async fn list_sample(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
            self.inner.list_sample(prefix, limit).await
        }

        async fn get(&self, key: &str) -> Result<crate::storage::ObjectReader> {
            ObjectStore::get(self.inner.as_ref(), key).await
        }
    }

    struct Fixture {
        _temp_dir: TempDir,
        fs: Arc<LocalFilesystem>,
        db: Arc<MemoryDatabase>,
        store: Arc<MemoryObjectStore>,
        metrics: Arc<MetricsRegistry>,
        pipeline: Arc<IngestPipeline>,
    }

    async fn fixture(capacity: usize) -> Fixture {
        fixture_with_timeout(capacity, Duration::from_secs(5)).await
    }

    async fn fixture_with_timeout(capacity: usize, processing_timeout: Duration) -> Fixture {
        fixture_with(capacity, processing_timeout, |store| store).await
    }

    async fn fixture_with(
        capacity: usize,
        processing_timeout: Duration,
        wrap: impl FnOnce(Arc<MemoryObjectStore>) -> Arc<dyn ObjectStore>,
    ) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let fs = Arc::new(LocalFilesystem::new(temp_dir.path()).await.unwrap());
        let db = Arc::new(MemoryDatabase::new());
        let store = Arc::new(MemoryObjectStore::new());
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let guarded = Arc::new(GuardedObjectStore::new(
            wrap(store.clone()),
            CircuitBreakerConfig::new(5, 2, Duration::from_secs(30)),
            metrics.clone(),
        ));
        let pipeline = IngestPipeline::new(
            IngestConfig {
                admission_timeout: Duration::from_secs(1),
                processing_timeout,
                debounce: Duration::from_millis(50),
            },
            fs.clone(),
            db.clone(),
            guarded,
            Arc::new(ConcurrencyGate::new(capacity, metrics.clone())),
            InFlight::new(),
            metrics.clone(),
        );
        Fixture {
            _temp_dir: temp_dir,
            fs,
            db,
            store,
            metrics,
            pipeline,
        }
    }

    async fn write_file(fs: &LocalFilesystem, collection: &str, name: &str, body: &[u8]) -> PathBuf {
        let dir = fs.collection_path(collection);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join(name);
        tokio::fs::write(&path, body).await.unwrap();
        path
    }

    async fn wait_for(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_created_file_is_uploaded_and_registered() {
        let f = fixture(4).await;
        let path = write_file(&f.fs, "photos", "cat.jpg", b"meow").await;

        f.pipeline.submit(FileEvent::new(&path, FileEventKind::Created));
        wait_for(|| f.metrics.watcher_files_processed.get() == 1).await;

        let record = f.db.get_object("photos", "cat.jpg").unwrap();
        assert_eq!(record.object_key, "photos/cat.jpg");
        assert_eq!(record.size_bytes, 4);
        assert_eq!(f.store.get("photos/cat.jpg").unwrap().sha256, record.sha256);

        // New collection got its key file
        let key = tokio::fs::read_to_string(f.fs.collection_path("photos").join(".vault_key"))
            .await
            .unwrap();
        assert!(f.db.verify_api_key("photos", &key).await.unwrap());
        assert!(f.pipeline.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_burst_is_processed_once() {
        let f = fixture(4).await;
        let path = write_file(&f.fs, "docs", "a.txt", b"v1").await;

        f.pipeline.submit(FileEvent::new(&path, FileEventKind::Created));
        f.pipeline.submit(FileEvent::new(&path, FileEventKind::Modified));
        f.pipeline.submit(FileEvent::new(&path, FileEventKind::Modified));
        wait_for(|| f.metrics.watcher_files_processed.get() == 1).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.metrics.watcher_files_processed.get(), 1);
        assert_eq!(f.metrics.watcher_events_debounced.get(), 2);
    }

    #[tokio::test]
    async fn test_deleted_file_is_removed() {
        let f = fixture(4).await;
        let path = write_file(&f.fs, "docs", "a.txt", b"v1").await;
        f.pipeline.submit(FileEvent::new(&path, FileEventKind::Created));
        wait_for(|| f.metrics.watcher_files_processed.get() == 1).await;

        tokio::fs::remove_file(&path).await.unwrap();
        f.pipeline.submit(FileEvent::new(&path, FileEventKind::Deleted));
        wait_for(|| f.metrics.watcher_files_processed.get() == 2).await;

        assert!(f.store.get("docs/a.txt").is_none());
        assert_eq!(f.db.get_object("docs", "a.txt").unwrap().status, ObjectStatus::Deleted);
    }

    #[tokio::test]
    async fn test_delete_waits_for_running_upload() {
        let f = fixture_with(4, Duration::from_secs(5), |store| {
            Arc::new(SlowUploads {
                inner: store,
                delay: Duration::from_millis(300),
            })
        })
        .await;
        let path = write_file(&f.fs, "docs", "a.txt", b"v1").await;

        f.pipeline.submit(FileEvent::new(&path, FileEventKind::Created));
        // Bytes are stored; the upload call has not returned yet
        wait_for(|| f.store.get("docs/a.txt").is_some()).await;
        assert_eq!(f.metrics.watcher_files_processed.get(), 0);

        tokio::fs::remove_file(&path).await.unwrap();
        f.pipeline.submit(FileEvent::new(&path, FileEventKind::Deleted));
        wait_for(|| f.metrics.watcher_files_processed.get() == 2).await;

        assert!(f.store.get("docs/a.txt").is_none());
        assert_eq!(f.db.get_object("docs", "a.txt").unwrap().status, ObjectStatus::Deleted);
        wait_for(|| f.pipeline.workers.lock().is_empty()).await;
    }

    #[tokio::test]
    async fn test_events_queued_behind_worker_collapse() {
        let f = fixture_with(4, Duration::from_secs(5), |store| {
            Arc::new(SlowUploads {
                inner: store,
                delay: Duration::from_millis(400),
            })
        })
        .await;
        let path = write_file(&f.fs, "docs", "a.txt", b"v1").await;

        f.pipeline.submit(FileEvent::new(&path, FileEventKind::Created));
        wait_for(|| f.store.get("docs/a.txt").is_some()).await;

        // Two settled events while the first upload runs: only the last one applies
        f.pipeline.submit(FileEvent::new(&path, FileEventKind::Deleted));
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.pipeline.submit(FileEvent::new(&path, FileEventKind::Modified));

        wait_for(|| f.metrics.watcher_files_processed.get() == 2).await;
        wait_for(|| f.pipeline.workers.lock().is_empty()).await;
        assert_eq!(f.metrics.watcher_files_processed.get(), 2);
        assert_eq!(f.db.get_object("docs", "a.txt").unwrap().status, ObjectStatus::Ready);
        assert!(f.store.get("docs/a.txt").is_some());
    }

    #[tokio::test]
    async fn test_store_failure_counts_as_failed() {
        let f = fixture(4).await;
        f.store.set_failing(true);
        let path = write_file(&f.fs, "docs", "a.txt", b"v1").await;

        f.pipeline.submit(FileEvent::new(&path, FileEventKind::Created));
        wait_for(|| f.metrics.watcher_files_failed.get() == 1).await;
        assert!(f.db.get_object("docs", "a.txt").is_none());
    }

    #[tokio::test]
    async fn test_ignored_paths_are_dropped() {
        let f = fixture(4).await;
        let key_file = write_file(&f.fs, "docs", ".vault_key", b"k").await;
        let stray = f.fs.root().join("stray.txt");

        f.pipeline.submit(FileEvent::new(key_file, FileEventKind::Created));
        f.pipeline.submit(FileEvent::new(stray, FileEventKind::Created));
        assert_eq!(f.pipeline.debouncing(), 0);
    }

    #[tokio::test]
    async fn test_processing_timeout() {
        let f = fixture_with_timeout(4, Duration::from_millis(100)).await;
        f.store.set_latency(Duration::from_secs(10));
        let path = write_file(&f.fs, "docs", "slow.bin", b"x").await;

        f.pipeline.submit(FileEvent::new(&path, FileEventKind::Created));
        wait_for(|| f.metrics.watcher_processing_timeouts.get() == 1).await;
        assert_eq!(f.metrics.watcher_files_failed.get(), 1);
        assert_eq!(f.pipeline.gate.in_progress(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_guard_refcount() {
        let set = InFlight::new();
        let a = set.enter("docs", "a.txt");
        let b = set.enter("docs", "a.txt");
        assert!(set.contains("docs", "a.txt"));
        drop(a);
        assert!(set.contains("docs", "a.txt"));
        drop(b);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_event_loop_creates_collections() {
        let f = fixture(4).await;
        tokio::fs::create_dir_all(f.fs.collection_path("new")).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = f.pipeline.spawn_event_loop(rx);

        tx.send(WatchEvent::CollectionCreated("new".into())).unwrap();
        let key_file = f.fs.collection_path("new").join(".vault_key");
        wait_for(|| key_file.exists()).await;
        assert_eq!(f.db.list_collections().await.unwrap(), vec!["new"]);

        drop(tx);
        handle.await.unwrap();
    }
}
