//! External collaborators of the reliability layer
//!
//! The relational record store, the object store and the watched filesystem
//! are consumed only through the traits in this module:
//!
//! - [`Database`]: collections, object records and API keys
//! - [`ObjectStore`]: blobs addressed by `<collection>/<name>`
//! - [`Filesystem`]: the watched collections root
//!
//! [`LocalFilesystem`] is the production filesystem and [`DirectoryObjectStore`]
//! keeps objects on local disk. [`MemoryDatabase`] and [`MemoryObjectStore`]
//! are in-process stand-ins with failure injection. [`GuardedObjectStore`]
//! puts a circuit breaker in front of any store.

use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncRead;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

pub mod guarded;
pub mod local;
pub mod memory;

pub use guarded::GuardedObjectStore;
pub use local::{DirectoryObjectStore, LocalFilesystem};
pub use memory::{MemoryDatabase, MemoryObjectStore};

/// File holding a collection's API key; never ingested
pub const VAULT_KEY_FILE: &str = ".vault_key";

/// Object content as returned by [`ObjectStore::get`]
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

// ============================================================================
// Records
// ============================================================================

/// Lifecycle of an object record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObjectStatus {
    /// Uploaded and registered
    Ready,
    /// Source file was deleted
    Deleted,
}

/// A registered object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Owning collection
    pub collection: String,
    /// File name inside the collection directory
    pub name: String,
    /// Object store key, `<collection>/<name>`
    pub object_key: String,
    /// Hex SHA-256 of the content
    pub sha256: String,
    /// Content length in bytes
    pub size_bytes: u64,
    /// Lifecycle status
    pub status: ObjectStatus,
    /// Last time the record was written
    pub updated_at: DateTime<Utc>,
}

impl ObjectRecord {
    /// Build a ready record for `<collection>/<name>`
    pub fn ready(collection: &str, name: &str, sha256: String, size_bytes: u64) -> Self {
        Self {
            collection: collection.to_string(),
            name: name.to_string(),
            object_key: object_key(collection, name),
            sha256,
            size_bytes,
            status: ObjectStatus::Ready,
            updated_at: Utc::now(),
        }
    }
}

/// Object store key for a file in a collection
pub fn object_key(collection: &str, name: &str) -> String {
    format!("{}/{}", collection, name)
}

/// Hidden files (including the API key file) are never ingested or reconciled
pub fn should_ignore(name: &str) -> bool {
    name.starts_with('.') || name == VAULT_KEY_FILE
}

/// Hex SHA-256 of an API key, as stored by the database
pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

/// Generate a random 64-character hex API key
pub fn generate_api_key() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// Relational record store
#[async_trait::async_trait]
pub trait Database: Send + Sync {
    /// Run a trivial query, failing with [`Error::Timeout`](crate::Error::Timeout)
    /// if it does not finish within `timeout`
    async fn ping(&self, timeout: Duration) -> Result<()>;

    /// Names of all active collections
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Create the collection if missing, returning the new API key when created
    async fn ensure_collection(&self, name: &str) -> Result<Option<String>>;

    /// Ready records of a collection, ordered by name
    async fn list_ready_objects(&self, collection: &str) -> Result<Vec<ObjectRecord>>;

    /// Insert or replace the record for `(collection, name)`
    async fn upsert_object(&self, record: ObjectRecord) -> Result<()>;

    /// Mark a record deleted, returning whether one existed
    async fn mark_deleted(&self, collection: &str, name: &str) -> Result<bool>;

    /// Whether `api_key` belongs to the active collection
    async fn verify_api_key(&self, collection: &str, api_key: &str) -> Result<bool>;
}

/// Blob store holding one object per ingested file
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether the configured bucket exists
    async fn bucket_exists(&self) -> Result<bool>;

    /// Upload the file at `path` under `key`
    async fn upload(&self, key: &str, path: &Path) -> Result<()>;

    /// Delete `key`; deleting an absent key succeeds
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether `key` exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Up to `limit` keys under `prefix`, in key order
    async fn list_sample(&self, prefix: &str, limit: usize) -> Result<Vec<String>>;

    /// Open `key` for reading, failing with
    /// [`StorageError::NotFound`](crate::error::StorageError::NotFound) when absent
    async fn get(&self, key: &str) -> Result<ObjectReader>;
}

/// The watched collections root
#[async_trait::async_trait]
pub trait Filesystem: Send + Sync {
    /// Root directory holding one sub-directory per collection
    fn root(&self) -> &Path;

    /// Collection directory names
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Ingestable file names directly inside a collection directory, sorted
    async fn list_entries(&self, collection: &str) -> Result<Vec<String>>;

    /// Write the health probe file
    async fn write_probe(&self, contents: &[u8]) -> Result<()>;

    /// Read the health probe file back
    async fn read_probe(&self) -> Result<Vec<u8>>;

    /// Remove the health probe file
    async fn delete_probe(&self) -> Result<()>;
}
