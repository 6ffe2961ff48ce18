//! Local filesystem access
//!
//! [`LocalFilesystem`] is the watched collections root. Layout:
//! `<root>/<collection>/<file>`. Only files directly inside a collection
//! directory are ingested; nested directories are ignored.
//!
//! [`DirectoryObjectStore`] is an [`ObjectStore`] keeping each object as a
//! file under `<dir>/<bucket>/<collection>/<name>`.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;

use super::{should_ignore, Filesystem, ObjectReader, ObjectStore, VAULT_KEY_FILE};
use crate::error::{Error, Result, StorageError};

/// Name of the file written and removed by the filesystem health probe
pub const HEALTH_PROBE_FILE: &str = ".health_check";

/// The collections root on local disk
#[derive(Debug, Clone)]
pub struct LocalFilesystem {
    root: PathBuf,
}

impl LocalFilesystem {
    /// Use `root`, creating it if missing
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Directory of a collection
    pub fn collection_path(&self, collection: &str) -> PathBuf {
        self.root.join(collection)
    }

    /// Split `<root>/<collection>/<name>` into its parts
    ///
    /// Returns `None` for paths outside the root, nested paths and ignored files.
    pub fn parse_collection_path(&self, path: &Path) -> Option<(String, String)> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel
            .components()
            .map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect::<Option<_>>()?;

        match parts.as_slice() {
            [collection, name] if !should_ignore(name) && !collection.starts_with('.') => {
                Some((collection.to_string(), name.to_string()))
            }
            _ => None,
        }
    }

    /// Write a newly provisioned API key into the collection directory
    pub async fn write_vault_key(&self, collection: &str, api_key: &str) -> Result<PathBuf> {
        let path = self.collection_path(collection).join(VAULT_KEY_FILE);
        // Readers never see a partially written key
        let staging = path.with_extension("tmp");
        fs::write(&staging, api_key).await?;
        fs::rename(&staging, &path).await?;
        Ok(path)
    }

    fn probe_path(&self) -> PathBuf {
        self.root.join(HEALTH_PROBE_FILE)
    }
}

#[async_trait::async_trait]
impl Filesystem for LocalFilesystem {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut collections = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    collections.push(name.to_string());
                }
            }
        }

        collections.sort();
        Ok(collections)
    }

    async fn list_entries(&self, collection: &str) -> Result<Vec<String>> {
        let dir = self.collection_path(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(format!("collection directory {:?}", dir)).into())
            }
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !should_ignore(name) {
                    names.push(name.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }

    async fn write_probe(&self, contents: &[u8]) -> Result<()> {
        fs::write(self.probe_path(), contents).await?;
        Ok(())
    }

    async fn read_probe(&self) -> Result<Vec<u8>> {
        Ok(fs::read(self.probe_path()).await?)
    }

    async fn delete_probe(&self) -> Result<()> {
        match fs::remove_file(self.probe_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Directory object store
// ============================================================================

/// Object store backed by a local directory
#[derive(Debug, Clone)]
pub struct DirectoryObjectStore {
    bucket_dir: PathBuf,
}

/// Failures on the store's own directory are store failures, not caller errors
fn store_error(key: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(format!("object {}", key)).into()
    } else {
        StorageError::ObjectStore(format!("{}: {}", key, e)).into()
    }
}

impl DirectoryObjectStore {
    /// Keep objects under `<dir>/<bucket>`, creating it if missing
    pub async fn new(dir: impl Into<PathBuf>, bucket: &str) -> Result<Self> {
        let bucket_dir = dir.into().join(bucket);
        fs::create_dir_all(&bucket_dir).await?;
        Ok(Self { bucket_dir })
    }

    /// Directory holding the bucket's objects
    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }

    /// On-disk path of `key`; keys that could escape the bucket are refused
    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let safe = Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || key.is_empty() {
            return Err(StorageError::NotFound(format!("object {}", key)).into());
        }
        Ok(self.bucket_dir.join(key))
    }
}

#[async_trait::async_trait]
impl ObjectStore for DirectoryObjectStore {
    async fn bucket_exists(&self) -> Result<bool> {
        match fs::metadata(&self.bucket_dir).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::ObjectStore(e.to_string()).into()),
        }
    }

    async fn upload(&self, key: &str, path: &Path) -> Result<()> {
        let target = self.object_path(key)?;
        // Opening the source is the caller's side; everything after is ours
        let mut source = fs::File::open(path).await?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(|e| store_error(key, e))?;
        }
        let staging = target.with_file_name(format!(
            ".{}.upload",
            target.file_name().and_then(|n| n.to_str()).unwrap_or("object")
        ));
        let mut staged = fs::File::create(&staging).await.map_err(|e| store_error(key, e))?;
        tokio::io::copy(&mut source, &mut staged)
            .await
            .map_err(|e| store_error(key, e))?;
        staged.sync_all().await.map_err(|e| store_error(key, e))?;
        drop(staged);
        fs::rename(&staging, &target).await.map_err(|e| store_error(key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let target = self.object_path(key)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_error(key, e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let Ok(target) = self.object_path(key) else {
            return Ok(false);
        };
        match fs::metadata(&target).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(store_error(key, e)),
        }
    }

    async fn list_sample(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        // Keys are `<collection>/<name>`, so a prefix names one collection directory
        let collection = prefix.trim_end_matches('/');
        let dir = self.bucket_dir.join(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_error(prefix, e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| store_error(prefix, e))? {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if let (true, Some(name)) = (is_file, entry.file_name().to_str()) {
                if !name.starts_with('.') {
                    keys.push(format!("{}/{}", collection, name));
                }
            }
        }

        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<ObjectReader> {
        let target = self.object_path(key)?;
        let file = fs::File::open(&target).await.map_err(|e| store_error(key, e))?;
        Ok(Box::new(file))
    }
}

/// Hex SHA-256 and size of a file, read in 64 KiB blocks
pub async fn compute_file_hash(path: &Path) -> Result<(String, u64)> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok((hex::encode(hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_fs() -> (TempDir, LocalFilesystem) {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalFilesystem::new(temp_dir.path().join("collections")).await.unwrap();
        (temp_dir, fs)
    }

    #[tokio::test]
    async fn test_list_collections_and_entries() {
        let (_temp_dir, local) = create_test_fs().await;
        let photos = local.collection_path("photos");
        fs::create_dir_all(photos.join("nested")).await.unwrap();
        fs::write(photos.join("b.jpg"), b"b").await.unwrap();
        fs::write(photos.join("a.jpg"), b"a").await.unwrap();
        fs::write(photos.join(".vault_key"), b"key").await.unwrap();
        fs::write(photos.join(".DS_Store"), b"").await.unwrap();
        fs::create_dir_all(local.collection_path("docs")).await.unwrap();
        fs::write(local.root().join("stray.txt"), b"x").await.unwrap();

        assert_eq!(local.list_collections().await.unwrap(), vec!["docs", "photos"]);
        assert_eq!(local.list_entries("photos").await.unwrap(), vec!["a.jpg", "b.jpg"]);
        assert!(local.list_entries("docs").await.unwrap().is_empty());
        assert!(local.list_entries("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_probe_roundtrip() {
        let (_temp_dir, local) = create_test_fs().await;

        local.write_probe(b"ok").await.unwrap();
        assert_eq!(local.read_probe().await.unwrap(), b"ok");
        local.delete_probe().await.unwrap();
        assert!(local.read_probe().await.is_err());
        // Deleting twice is fine
        local.delete_probe().await.unwrap();
    }

    #[tokio::test]
    async fn test_parse_collection_path() {
        let (_temp_dir, local) = create_test_fs().await;
        let root = local.root().to_path_buf();

        assert_eq!(
            local.parse_collection_path(&root.join("photos").join("cat.jpg")),
            Some(("photos".to_string(), "cat.jpg".to_string()))
        );
        assert_eq!(local.parse_collection_path(&root.join("photos")), None);
        assert_eq!(local.parse_collection_path(&root.join("photos/.vault_key")), None);
        assert_eq!(local.parse_collection_path(&root.join("photos/sub/cat.jpg")), None);
        assert_eq!(local.parse_collection_path(Path::new("/elsewhere/a/b")), None);
    }

    #[tokio::test]
    async fn test_compute_file_hash() {
        let (_temp_dir, local) = create_test_fs().await;
        let path = local.root().join("hello.txt");
        fs::write(&path, b"hello world").await.unwrap();

        let (hash, size) = compute_file_hash(&path).await.unwrap();
        assert_eq!(size, 11);
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_directory_store_roundtrip() {
        let (temp_dir, local) = create_test_fs().await;
        let store = DirectoryObjectStore::new(temp_dir.path().join("objects"), "vault")
            .await
            .unwrap();
        assert!(store.bucket_exists().await.unwrap());

        let source = local.root().join("a.txt");
        fs::write(&source, b"alpha").await.unwrap();
        store.upload("docs/a.txt", &source).await.unwrap();
        store.upload("docs/b.txt", &source).await.unwrap();
        store.upload("photos/c.jpg", &source).await.unwrap();

        assert!(store.exists("docs/a.txt").await.unwrap());
        assert_eq!(
            store.list_sample("docs/", 10).await.unwrap(),
            vec!["docs/a.txt", "docs/b.txt"]
        );
        assert_eq!(store.list_sample("docs/", 1).await.unwrap(), vec!["docs/a.txt"]);
        assert!(store.list_sample("empty/", 10).await.unwrap().is_empty());

        let mut body = Vec::new();
        store
            .get("docs/a.txt")
            .await
            .unwrap()
            .read_to_end(&mut body)
            .await
            .unwrap();
        assert_eq!(body, b"alpha");

        store.delete("docs/a.txt").await.unwrap();
        store.delete("docs/a.txt").await.unwrap();
        assert!(!store.exists("docs/a.txt").await.unwrap());
        assert!(matches!(
            store.get("docs/a.txt").await,
            Err(Error::Storage(StorageError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_directory_store_error_kinds() {
        let (temp_dir, local) = create_test_fs().await;
        let store = DirectoryObjectStore::new(temp_dir.path().join("objects"), "vault")
            .await
            .unwrap();

        // A missing source file is reported as plain IO
        let missing = local.root().join("missing.txt");
        assert!(matches!(store.upload("docs/missing.txt", &missing).await, Err(Error::Io(_))));

        // Keys never leave the bucket
        assert!(store.get("../outside").await.is_err());
        assert!(!store.exists("/etc/passwd").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_vault_key() {
        let (_temp_dir, local) = create_test_fs().await;
        fs::create_dir_all(local.collection_path("docs")).await.unwrap();

        let path = local.write_vault_key("docs", "k3y").await.unwrap();
        assert_eq!(fs::read_to_string(path).await.unwrap(), "k3y");
        assert!(local.list_entries("docs").await.unwrap().is_empty());
    }
}
