//! Cross-process file locks
//!
//! In-process callers serialize on tokio primitives; these advisory locks
//! extend the exclusion to other processes sharing the same filesystem.
//! Uses `fs2` rather than `std::fs::File::lock` for older toolchains.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to create lock file {path}: {source}")]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to acquire lock {path}: {source}")]
    AcquireFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Lock task panicked or was cancelled: {0}")]
    Join(String),
}

/// Holds an exclusive lock until dropped
pub struct FileLockGuard {
    file: File,
    lock_path: PathBuf,
}

impl FileLockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        debug!("Releasing lock: {}", self.lock_path.display());
        let _ = FileExt::unlock(&self.file);
    }
}

impl std::fmt::Debug for FileLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLockGuard")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

/// Lock file path for a protected file.
///
/// - `/audit/s1/session.json` → `/audit/s1/session.json.lock`
/// - `/repo/.git/HEAD` → `/repo/.git/HEAD.lock`
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock_path = path.to_path_buf();
    match lock_path.extension() {
        Some(ext) => {
            let new_ext = format!("{}.lock", ext.to_string_lossy());
            lock_path.set_extension(new_ext);
        }
        None => {
            lock_path.set_extension("lock");
        }
    }
    lock_path
}

/// Block until an exclusive lock on `lock_path` is held
pub fn lock_exclusive(lock_path: &Path) -> Result<FileLockGuard, LockError> {
    debug!("Waiting to acquire exclusive lock: {}", lock_path.display());

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(|source| LockError::CreateFailed {
            path: lock_path.to_path_buf(),
            source,
        })?;

    // Fully qualified: newer std has an inherent File::lock_exclusive
    FileExt::lock_exclusive(&file).map_err(|source| LockError::AcquireFailed {
        path: lock_path.to_path_buf(),
        source,
    })?;

    Ok(FileLockGuard {
        file,
        lock_path: lock_path.to_path_buf(),
    })
}

/// [`lock_exclusive`] without blocking the async runtime
pub async fn lock_exclusive_async(lock_path: PathBuf) -> Result<FileLockGuard, LockError> {
    tokio::task::spawn_blocking(move || lock_exclusive(&lock_path))
        .await
        .map_err(|e| LockError::Join(e.to_string()))?
}
