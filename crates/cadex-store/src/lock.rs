//! Cross-process exclusive regions.
//!
//! Every cache statement sequence runs inside one region so that several
//! client processes sharing a cache file never interleave writers.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, warn};

use crate::StoreError;

const DEFAULT_POLL: Duration = Duration::from_millis(100);

/// Acquire/release capability guarding a shared resource.
///
/// `acquire` blocks until the region is held; there is no timeout.
/// Dropping the guard releases the region.
pub trait ExclusiveRegion: Send + Sync {
    type Guard: Send;

    fn acquire(&self) -> Result<Self::Guard, StoreError>;
}

/// Advisory OS file lock, polled until acquired.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    poll: Duration,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll: DEFAULT_POLL,
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(error = %e, "failed to release cache lock");
        }
    }
}

impl ExclusiveRegion for FileLock {
    type Guard = FileLockGuard;

    fn acquire(&self) -> Result<FileLockGuard, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        let mut announced = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(FileLockGuard { file }),
                Err(e) if is_contended(&e) => {
                    if !announced {
                        debug!(path = %self.path.display(), "waiting for cache lock");
                        announced = true;
                    }
                    thread::sleep(self.poll);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn creates_lock_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("cache.lock");
        let lock = FileLock::new(&path);
        let guard = lock.acquire().unwrap();
        assert!(path.exists());
        drop(guard);
    }

    #[test]
    fn reacquire_after_release() {
        let tmp = tempfile::TempDir::new().unwrap();
        let lock = FileLock::new(tmp.path().join("cache.lock"));
        drop(lock.acquire().unwrap());
        drop(lock.acquire().unwrap());
    }

    #[test]
    fn holders_never_overlap() {
        let tmp = tempfile::TempDir::new().unwrap();
        let lock = FileLock::new(tmp.path().join("cache.lock"))
            .with_poll_interval(Duration::from_millis(5));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..5 {
                        let _guard = lock.acquire().unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
