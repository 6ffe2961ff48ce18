//! In-process database and object store
//!
//! Used by the reference server when no external services are configured,
//! and by tests. Both support failure injection (`set_failing`), added
//! latency (`set_latency`) and count every call that reaches them.
//!
//! Objects uploaded through the trait keep their content so they can be read
//! back; objects seeded with [`MemoryObjectStore::put`] read back empty.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;

use super::{generate_api_key, hash_api_key, Database, ObjectReader, ObjectRecord, ObjectStatus, ObjectStore};
use crate::error::{Error, Result, StorageError};

/// Shared failure-injection knobs
#[derive(Debug, Default)]
struct Faults {
    failing: AtomicBool,
    latency_ms: AtomicU64,
    calls: AtomicU64,
}

impl Faults {
    async fn enter(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.failing.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Database
// ============================================================================

#[derive(Debug, Clone)]
struct CollectionRow {
    api_key_hash: String,
    active: bool,
}

/// In-memory [`Database`]
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    collections: RwLock<BTreeMap<String, CollectionRow>>,
    objects: RwLock<BTreeMap<(String, String), ObjectRecord>>,
    faults: Faults,
}

impl MemoryDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.faults.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every subsequent call
    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Calls received so far
    pub fn call_count(&self) -> u64 {
        self.faults.calls.load(Ordering::SeqCst)
    }

    /// Register a collection with a known API key
    pub fn insert_collection(&self, name: &str, api_key: &str) {
        self.collections.write().insert(
            name.to_string(),
            CollectionRow {
                api_key_hash: hash_api_key(api_key),
                active: true,
            },
        );
    }

    /// Deactivate a collection; its key stops verifying
    pub fn deactivate_collection(&self, name: &str) {
        if let Some(row) = self.collections.write().get_mut(name) {
            row.active = false;
        }
    }

    /// Record for `(collection, name)` regardless of status
    pub fn get_object(&self, collection: &str, name: &str) -> Option<ObjectRecord> {
        self.objects
            .read()
            .get(&(collection.to_string(), name.to_string()))
            .cloned()
    }

    async fn enter(&self) -> Result<()> {
        if self.faults.enter().await {
            return Err(Error::Connection("database unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Database for MemoryDatabase {
    async fn ping(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.enter()).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("database ping", timeout)),
        }
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.enter().await?;
        Ok(self
            .collections
            .read()
            .iter()
            .filter(|(_, row)| row.active)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn ensure_collection(&self, name: &str) -> Result<Option<String>> {
        self.enter().await?;
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Ok(None);
        }

        let api_key = generate_api_key();
        collections.insert(
            name.to_string(),
            CollectionRow {
                api_key_hash: hash_api_key(&api_key),
                active: true,
            },
        );
        Ok(Some(api_key))
    }

    async fn list_ready_objects(&self, collection: &str) -> Result<Vec<ObjectRecord>> {
        self.enter().await?;
        Ok(self
            .objects
            .read()
            .range((collection.to_string(), String::new())..)
            .take_while(|((c, _), _)| c == collection)
            .filter(|(_, record)| record.status == ObjectStatus::Ready)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn upsert_object(&self, record: ObjectRecord) -> Result<()> {
        self.enter().await?;
        if !self.collections.read().contains_key(&record.collection) {
            return Err(StorageError::NotFound(format!("collection {}", record.collection)).into());
        }
        self.objects
            .write()
            .insert((record.collection.clone(), record.name.clone()), record);
        Ok(())
    }

    async fn mark_deleted(&self, collection: &str, name: &str) -> Result<bool> {
        self.enter().await?;
        let mut objects = self.objects.write();
        match objects.get_mut(&(collection.to_string(), name.to_string())) {
            Some(record) => {
                record.status = ObjectStatus::Deleted;
                record.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn verify_api_key(&self, collection: &str, api_key: &str) -> Result<bool> {
        self.enter().await?;
        let expected = hash_api_key(api_key);
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|row| row.active && row.api_key_hash == expected)
            .unwrap_or(false))
    }
}

// ============================================================================
// Object store
// ============================================================================

/// Metadata kept for a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Content length
    pub size_bytes: u64,
    /// Hex SHA-256 of the content
    pub sha256: String,
}

/// In-memory [`ObjectStore`]
#[derive(Debug)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    contents: RwLock<HashMap<String, Vec<u8>>>,
    bucket_present: AtomicBool,
    faults: Faults,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            contents: RwLock::new(HashMap::new()),
            bucket_present: AtomicBool::new(true),
            faults: Faults::default(),
        }
    }
}

impl MemoryObjectStore {
    /// Create an empty store with its bucket present
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.faults.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every subsequent call
    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Simulate a missing bucket
    pub fn set_bucket_present(&self, present: bool) {
        self.bucket_present.store(present, Ordering::SeqCst);
    }

    /// Calls received so far
    pub fn call_count(&self) -> u64 {
        self.faults.calls.load(Ordering::SeqCst)
    }

    /// Store an object directly, bypassing the trait
    pub fn put(&self, key: &str, object: StoredObject) {
        self.objects.write().insert(key.to_string(), object);
    }

    /// Remove an object directly, bypassing the trait
    pub fn remove(&self, key: &str) -> Option<StoredObject> {
        self.contents.write().remove(key);
        self.objects.write().remove(key)
    }

    /// Stored object metadata
    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().get(key).cloned()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn enter(&self) -> Result<()> {
        if self.faults.enter().await {
            return Err(StorageError::ObjectStore("connection refused".to_string()).into());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn bucket_exists(&self) -> Result<bool> {
        self.enter().await?;
        Ok(self.bucket_present.load(Ordering::SeqCst))
    }

    async fn upload(&self, key: &str, path: &Path) -> Result<()> {
        self.enter().await?;
        let (sha256, size_bytes) = super::local::compute_file_hash(path).await?;
        let data = tokio::fs::read(path).await?;
        self.contents.write().insert(key.to_string(), data);
        self.put(key, StoredObject { size_bytes, sha256 });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.enter().await?;
        self.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.enter().await?;
        Ok(self.objects.read().contains_key(key))
    }

    async fn list_sample(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        self.enter().await?;
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit)
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn get(&self, key: &str) -> Result<ObjectReader> {
        self.enter().await?;
        if !self.objects.read().contains_key(key) {
            return Err(StorageError::NotFound(format!("object {}", key)).into());
        }
        let data = self.contents.read().get(key).cloned().unwrap_or_default();
        Ok(Box::new(Cursor::new(data)))
    }
}
