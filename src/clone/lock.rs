//! Cross-process file locks for working copies.
//!
//! The in-process [`KeyedLocks`](crate::utils::KeyedLocks) table serializes
//! tasks inside one bkstg process. A second process (another terminal, an
//! editor integration) sharing the clone directory is kept out by an exclusive
//! lock on `<clone_dir>/.locks/<key>.lock`. The lock is released when the
//! [`CloneLock`] is dropped.

use anyhow::{Context, Result};
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Name of the directory holding lock files.
pub const LOCKS_DIR: &str = ".locks";

/// Exclusive file lock on one working copy.
#[derive(Debug)]
pub struct CloneLock {
    file: File,
    path: PathBuf,
}

impl CloneLock {
    /// Blocks (off the async runtime) until the lock for `key` is held.
    pub async fn acquire(clone_dir: &Path, key: &str) -> Result<Self> {
        let locks_dir = clone_dir.join(LOCKS_DIR);
        tokio::fs::create_dir_all(&locks_dir).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                anyhow::anyhow!(
                    "Permission denied: cannot create locks directory at {}",
                    locks_dir.display()
                )
            } else {
                anyhow::anyhow!("Failed to create directory {}: {}", locks_dir.display(), e)
            }
        })?;

        let lock_path = locks_dir.join(format!("{key}.lock"));
        let lock_path_clone = lock_path.clone();
        let key = key.to_string();

        let file = tokio::task::spawn_blocking(move || -> Result<File> {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&lock_path_clone)
                .with_context(|| {
                    format!("Failed to open lock file: {}", lock_path_clone.display())
                })?;

            file.lock_exclusive().with_context(|| format!("Failed to acquire lock for: {key}"))?;
            Ok(file)
        })
        .await
        .context("Failed to spawn blocking task for lock acquisition")??;

        Ok(Self {
            file,
            path: lock_path,
        })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CloneLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio::sync::Barrier;

    #[tokio::test]
    async fn test_lock_file_created() {
        let temp_dir = TempDir::new().unwrap();
        let lock = CloneLock::acquire(temp_dir.path(), "acme_catalog_main").await.unwrap();

        let expected = temp_dir.path().join(LOCKS_DIR).join("acme_catalog_main.lock");
        assert_eq!(lock.path(), expected);
        drop(lock);
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn test_same_key_blocks() {
        let temp_dir = TempDir::new().unwrap();
        let dir = Arc::new(temp_dir.path().to_path_buf());
        let barrier = Arc::new(Barrier::new(2));

        let dir1 = dir.clone();
        let barrier1 = barrier.clone();
        let holder = tokio::spawn(async move {
            let _lock = CloneLock::acquire(&dir1, "shared").await.unwrap();
            barrier1.wait().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let waiter = tokio::spawn(async move {
            barrier.wait().await;
            let start = Instant::now();
            let _lock = CloneLock::acquire(&dir, "shared").await.unwrap();
            assert!(start.elapsed() >= Duration::from_millis(50));
        });

        holder.await.unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let temp_dir = TempDir::new().unwrap();
        let _a = CloneLock::acquire(temp_dir.path(), "a").await.unwrap();

        let start = Instant::now();
        let _b = CloneLock::acquire(temp_dir.path(), "b").await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(200));
    }
}
