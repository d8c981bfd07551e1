//! File-based mutual exclusion across processes sharing a persisted cache

use std::{
    fs::{File, OpenOptions, TryLockError},
    io::{self, Seek, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;

use crate::storage::lock_path_for;

/// The default delay between acquisition attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The default number of retries before giving up, roughly one minute at the
/// default delay
pub const DEFAULT_RETRY_COUNT: u32 = 600;

/// Where the lock lives and how patiently to wait for it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockOptions {
    path: PathBuf,
    retry_delay: Duration,
    retry_count: u32,
}

impl LockOptions {
    /// Lock options for a lock file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_count: DEFAULT_RETRY_COUNT,
        }
    }

    /// Lock options guarding the cache file at `cache_path`
    pub fn for_cache_file(cache_path: &Path) -> Self {
        Self::new(lock_path_for(cache_path))
    }

    /// Sets the delay between attempts
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Sets the number of retries after the first attempt
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// The lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The delay between attempts
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// The number of retries after the first attempt
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

/// The lock could not be acquired within the configured number of attempts
#[derive(Debug, Error)]
#[error("timed out acquiring cache lock {} after {attempts} attempts", path.display())]
pub struct LockTimeout {
    path: PathBuf,
    attempts: u32,
    #[source]
    last_error: Option<io::Error>,
}

impl LockTimeout {
    /// The lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How many attempts were made
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Acquires the cross-process lock described by a set of [`LockOptions`]
///
/// Holding the lock says nothing about other tasks in the same process; it
/// must be paired with an intra-process mutex, taken after this lock.
#[derive(Debug)]
pub struct CrossProcessLock;

impl CrossProcessLock {
    /// Acquires the lock, sleeping asynchronously between attempts
    #[tracing::instrument(skip(options), fields(path = %options.path.display()))]
    pub async fn acquire(options: &LockOptions) -> Result<LockGuard, LockTimeout> {
        let mut last_error = None;
        for attempt in 0..=options.retry_count {
            if attempt > 0 {
                tokio::time::sleep(options.retry_delay).await;
            }
            match try_lock(&options.path) {
                Ok(guard) => {
                    tracing::trace!(attempt, "cache lock acquired");
                    return Ok(guard);
                }
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "cache lock contended");
                    last_error = Some(err);
                }
            }
        }

        Err(options.timeout(last_error))
    }

    /// Acquires the lock, blocking the current thread between attempts
    pub fn acquire_blocking(options: &LockOptions) -> Result<LockGuard, LockTimeout> {
        let mut last_error = None;
        for attempt in 0..=options.retry_count {
            if attempt > 0 {
                std::thread::sleep(options.retry_delay);
            }
            match try_lock(&options.path) {
                Ok(guard) => return Ok(guard),
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "cache lock contended");
                    last_error = Some(err);
                }
            }
        }

        Err(options.timeout(last_error))
    }
}

impl LockOptions {
    fn timeout(&self, last_error: Option<io::Error>) -> LockTimeout {
        let attempts = self.retry_count.saturating_add(1);
        tracing::warn!(
            path = %self.path.display(),
            attempts,
            "gave up waiting for cache lock"
        );
        LockTimeout {
            path: self.path.clone(),
            attempts,
            last_error,
        }
    }
}

fn try_lock(path: &Path) -> io::Result<LockGuard> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut opts = OpenOptions::new();
    opts.create(true).read(true).write(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        opts.share_mode(0);
    }

    let mut file = opts.open(path)?;
    match file.try_lock() {
        Ok(()) => {}
        Err(TryLockError::WouldBlock) => {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "lock held by another process",
            ))
        }
        Err(TryLockError::Error(err)) => return Err(err),
    }

    let exe = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    file.set_len(0)?;
    file.rewind()?;
    write!(file, "{} {}", std::process::id(), exe)?;
    file.flush()?;

    Ok(LockGuard {
        file: Some(file),
        path: path.to_owned(),
    })
}

/// A held cross-process lock, released when dropped
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    file: Option<File>,
    path: PathBuf,
}

impl LockGuard {
    /// The lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
            drop(file);
        }

        #[cfg(windows)]
        {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
