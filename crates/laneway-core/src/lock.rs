//! Single-writer advisory lock kept beside an append-only file.
//!
//! The lock file is `<target>.lock` (or any path the caller picks). Only
//! writers take it; readers of `status.events.jsonl` and `clock.json` never
//! block.

use crate::error::ErrorCode;
use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

/// Default wait for a contended writer lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const FIRST_BACKOFF: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock timed out after {waited:?} at {}", .path.display())]
    Timeout { path: PathBuf, waited: Duration },
    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LockError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::Io(_) => ErrorCode::EventLogWriteFailed,
        }
    }

    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

/// Exclusive lock held until dropped or [`WriterLock::release`]d.
#[derive(Debug)]
pub struct WriterLock {
    file: File,
    path: PathBuf,
}

impl WriterLock {
    /// Take the lock, retrying with growing backoff until `timeout`.
    ///
    /// Parent directories are created if missing.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] if another writer keeps the lock past
    /// `timeout`; [`LockError::Io`] if the lock file cannot be opened.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let file = open_lock_file(path)?;
        let start = Instant::now();
        let mut backoff = FIRST_BACKOFF;

        while file.try_lock_exclusive().is_err() {
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            thread::sleep(backoff.min(timeout.saturating_sub(waited)));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Take the lock only if it is free right now.
    ///
    /// # Errors
    ///
    /// [`LockError::Io`] if the lock file cannot be opened.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, LockError> {
        let file = open_lock_file(path)?;
        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }
        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn release(self) {
        drop(self);
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "lock path has no parent"))?;
    fs::create_dir_all(parent)?;
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
}
