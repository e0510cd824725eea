//! Content-addressed blob storage
//!
//! The dedup services only need a narrow capability from the object store:
//! put, get and delete keyed by content hash. [`BlobStore`] captures that
//! contract so any content-addressable backend can sit behind the ingest
//! coordinator and the garbage collector.
//!
//! Two backends ship with the crate:
//! - [`FsBlobStore`] - objects as files under a sharded directory tree
//! - [`MemoryBlobStore`] - in-process map with operation counters and
//!   failure injection (for tests)

use crate::error::BlobStoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Boxed reader over a stored object
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Content-addressable object store
///
/// `put` must be idempotent per key: writing the same key twice leaves one
/// object with the same bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store exactly `size` bytes read from `reader` under `key`
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
    ) -> Result<(), BlobStoreError>;

    /// Open the object stored under `key`
    async fn get(&self, key: &str) -> Result<BlobReader, BlobStoreError>;

    /// Remove the object stored under `key`. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), BlobStoreError>;

    /// Check whether an object is stored under `key`
    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(BlobStoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Filesystem backend
// ============================================================================

/// Blob storage on the local filesystem
pub struct FsBlobStore {
    /// Root directory for blob storage
    root_dir: PathBuf,
}

impl FsBlobStore {
    /// Create a new blob store at the given directory
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self, BlobStoreError> {
        let root_dir = root_dir.as_ref().to_path_buf();

        fs::create_dir_all(&root_dir).await?;

        info!(path = %root_dir.display(), "Initialized blob store");

        Ok(Self { root_dir })
    }

    /// Get path for a blob by key
    fn blob_path(&self, key: &str) -> Result<PathBuf, BlobStoreError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(BlobStoreError::Backend(format!("invalid object key: {:?}", key)));
        }

        // First 4 chars of the digest as subdirectory for better filesystem distribution
        let hash_part = key.strip_prefix("sha256-").unwrap_or(key);
        let subdir: String = hash_part.chars().take(4).collect();
        Ok(self.root_dir.join(subdir).join(key))
    }

    /// Get storage statistics
    pub async fn stats(&self) -> Result<StorageStats, BlobStoreError> {
        let mut total_blobs = 0u64;
        let mut total_bytes = 0u64;

        let mut entries = fs::read_dir(&self.root_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let mut subentries = fs::read_dir(entry.path()).await?;
            while let Some(subentry) = subentries.next_entry().await? {
                let name = subentry.file_name();
                if name.to_string_lossy().contains(".tmp-") {
                    continue;
                }
                let metadata = subentry.metadata().await?;
                if metadata.is_file() {
                    total_blobs += 1;
                    total_bytes += metadata.len();
                }
            }
        }

        Ok(StorageStats {
            total_blobs,
            total_bytes,
        })
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        key: &str,
        _content_type: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
    ) -> Result<(), BlobStoreError> {
        let blob_path = self.blob_path(key)?;

        if fs::metadata(&blob_path).await.is_ok() {
            debug!(key = %key, "Blob already exists");
            return Ok(());
        }

        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Stage next to the final path so the rename stays on one filesystem
        let staging = blob_path.with_file_name(format!("{}.tmp-{}", key, uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&staging).await?;

        // Read one byte past the declared size to catch overlong input
        let mut limited = reader.take(size.saturating_add(1));
        let received = match tokio::io::copy(&mut limited, &mut file).await {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                fs::remove_file(&staging).await.ok();
                return Err(e.into());
            }
        };

        if received != size {
            drop(file);
            fs::remove_file(&staging).await.ok();
            return Err(BlobStoreError::SizeMismatch {
                key: key.to_string(),
                declared: size,
                received,
            });
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&staging, &blob_path).await?;

        info!(key = %key, size, "Stored blob");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<BlobReader, BlobStoreError> {
        let blob_path = self.blob_path(key)?;
        match fs::File::open(&blob_path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        let blob_path = self.blob_path(key)?;
        match fs::remove_file(&blob_path).await {
            Ok(()) => {
                info!(key = %key, "Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(key = %key, "Blob already absent on delete");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        let blob_path = self.blob_path(key)?;
        Ok(fs::metadata(blob_path).await.is_ok())
    }
}

/// Storage statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageStats {
    pub total_blobs: u64,
    pub total_bytes: u64,
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryObject {
    data: Vec<u8>,
    content_type: String,
}

/// In-memory blob store
///
/// Counts every `put` and `delete` call and can be told to fail either, which
/// lets tests observe exactly how the services drive the backend.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, MemoryObject>>,
    puts: AtomicUsize,
    deletes: AtomicUsize,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put` calls that reached the backend (including failed ones)
    pub fn put_calls(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of `delete` calls that reached the backend (including failed ones)
    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects.read().await.get(key).map(|o| o.content_type.clone())
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
    ) -> Result<(), BlobStoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BlobStoreError::Backend("injected put failure".into()));
        }

        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        if data.len() as u64 != size {
            return Err(BlobStoreError::SizeMismatch {
                key: key.to_string(),
                declared: size,
                received: data.len() as u64,
            });
        }

        self.objects
            .write()
            .await
            .entry(key.to_string())
            .or_insert_with(|| MemoryObject {
                data,
                content_type: content_type.to_string(),
            });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<BlobReader, BlobStoreError> {
        let objects = self.objects.read().await;
        let object = objects
            .get(key)
            .ok_or_else(|| BlobStoreError::NotFound(key.to_string()))?;
        Ok(Box::new(Cursor::new(object.data.clone())))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BlobStoreError::Backend("injected delete failure".into()));
        }
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        Ok(self.contains(key).await)
    }
}
