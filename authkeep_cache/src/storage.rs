//! Byte-level storage backends for persisted caches
//!
//! Secure backends (OS keychains, credential vaults, encrypted files) live
//! outside this crate and plug in through [`StorageBackend`]. The backends
//! here are a plaintext file, which must be chosen explicitly, and a memory
//! buffer for tests.

use std::{
    error, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::OpenOptions;

use crate::lock::LockOptions;

/// Suffix appended to a cache file's path to name its cross-process lock
pub const LOCK_FILE_SUFFIX: &str = ".lockfile";

/// Derives the lock file path for a cache stored at `cache_path`
pub fn lock_path_for(cache_path: &Path) -> PathBuf {
    let mut path = cache_path.as_os_str().to_owned();
    path.push(LOCK_FILE_SUFFIX);
    PathBuf::from(path)
}

/// An error from a storage backend
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error
    #[error("storage I/O failed")]
    Io(#[from] io::Error),
    /// A backend-specific failure
    #[error("storage backend failed")]
    Backend(#[source] Box<dyn error::Error + Send + Sync + 'static>),
}

/// Durable storage for a serialized cache blob
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Loads the stored bytes; an absent blob is empty
    async fn load(&self) -> Result<Vec<u8>, StorageError>;

    /// Replaces the stored bytes
    async fn store(&self, data: &[u8]) -> Result<(), StorageError>;

    /// Removes the stored blob
    async fn clear(&self) -> Result<(), StorageError>;

    /// The location of the stored blob, if it lives on the filesystem
    ///
    /// Used to derive the cross-process lock path.
    fn location(&self) -> Option<&Path> {
        None
    }
}

/// A storage backend that keeps the cache unencrypted in a local file
///
/// On Unix the file is created readable and writable only by its owner.
/// Prefer an OS-protected backend wherever one is available.
#[derive(Debug)]
pub struct PlaintextFileStorage {
    path: PathBuf,
}

impl PlaintextFileStorage {
    /// Constructs a new plaintext file backend
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path of the cache file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock options for the default lock file next to the cache file
    pub fn lock_options(&self) -> LockOptions {
        LockOptions::for_cache_file(&self.path)
    }
}

#[async_trait]
impl StorageBackend for PlaintextFileStorage {
    async fn load(&self) -> Result<Vec<u8>, StorageError> {
        use tokio::io::AsyncReadExt;

        let mut file = match OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;
        Ok(data)
    }

    async fn store(&self, data: &[u8]) -> Result<(), StorageError> {
        use tokio::io::AsyncWriteExt;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Unlocked readers must never observe a partial blob.
        let mut staging = self.path.as_os_str().to_owned();
        staging.push(format!(".{}.tmp", std::process::id()));
        let staging = PathBuf::from(staging);

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&staging).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        match tokio::fs::remove_file(&self.path).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// A storage backend holding the blob in memory
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Mutex<Vec<u8>>,
}

impl MemoryStorage {
    /// Constructs an empty memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a memory backend holding `data`
    pub fn with_data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Mutex::new(data.into()),
        }
    }

    /// A copy of the stored bytes
    pub fn data(&self) -> Vec<u8> {
        self.data
            .lock()
            .map(|d| d.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn replace(&self, data: Vec<u8>) {
        match self.data.lock() {
            Ok(mut guard) => *guard = data,
            Err(poisoned) => *poisoned.into_inner() = data,
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn load(&self) -> Result<Vec<u8>, StorageError> {
        Ok(self.data())
    }

    async fn store(&self, data: &[u8]) -> Result<(), StorageError> {
        self.replace(data.to_vec());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.replace(Vec::new());
        Ok(())
    }
}
