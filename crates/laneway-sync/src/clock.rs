//! Lamport logical clock, persisted per node.
//!
//! # State file
//!
//! ```text
//! {"node_id":"3fa9c02b17de","value":42}
//! ```
//!
//! Written with temp-file-then-rename under a sibling `.lock` file. Each
//! update first folds in whatever another process on the same node has
//! already persisted, so two writers sharing one file never hand out the
//! same value.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use laneway_core::error::ErrorCode;
use laneway_core::lock::{DEFAULT_LOCK_TIMEOUT, LockError, WriterLock};
use laneway_core::store::write_atomic;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// File name of the clock state under the laneway home directory.
pub const CLOCK_FILE: &str = "clock.json";

#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    #[error("clock I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("clock state at {} is not valid JSON: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("lamport clock cannot advance past {value}")]
    Overflow { value: u64 },

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl ClockError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } | Self::Corrupt { .. } => ErrorCode::ClockPersistFailed,
            Self::Overflow { .. } => ErrorCode::ClockOverflow,
            Self::Lock(err) => err.code(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ClockState {
    value: u64,
    node_id: String,
}

/// Monotonic logical counter.
///
/// The value never decreases. `tick` and `receive` return the new value and
/// only update memory after the new value is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LamportClock {
    value: u64,
    node_id: String,
    path: Option<PathBuf>,
}

impl LamportClock {
    /// A clock that never touches disk.
    #[must_use]
    pub fn in_memory(value: u64, node_id: impl Into<String>) -> Self {
        Self {
            value,
            node_id: node_id.into(),
            path: None,
        }
    }

    /// Load the clock persisted at `path`, starting at zero with a derived
    /// node id when the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::Io`] if the file exists but cannot be read and
    /// [`ClockError::Corrupt`] if it does not parse.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ClockError> {
        let path = path.into();
        let state = read_state(&path)?.unwrap_or_else(|| ClockState {
            value: 0,
            node_id: node_id(),
        });
        debug!(path = %path.display(), value = state.value, "loaded lamport clock");
        Ok(Self {
            value: state.value,
            node_id: state.node_id,
            path: Some(path),
        })
    }

    /// [`LamportClock::load`] from `<home>/clock.json`.
    ///
    /// # Errors
    ///
    /// Same as [`LamportClock::load`].
    pub fn load_in(home: &Path) -> Result<Self, ClockError> {
        Self::load(home.join(CLOCK_FILE))
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.value
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Advance for a local event.
    ///
    /// # Errors
    ///
    /// Fails if the new value cannot be persisted or would pass `u64::MAX`;
    /// the clock is unchanged.
    pub fn tick(&mut self) -> Result<u64, ClockError> {
        self.advance(|current| current.checked_add(1))
    }

    /// Merge a remote timestamp: `max(local, remote) + 1`.
    ///
    /// # Errors
    ///
    /// Fails if the new value cannot be persisted or would pass `u64::MAX`;
    /// the clock is unchanged.
    pub fn receive(&mut self, remote: u64) -> Result<u64, ClockError> {
        self.advance(|current| current.max(remote).checked_add(1))
    }

    fn advance(&mut self, step: impl FnOnce(u64) -> Option<u64>) -> Result<u64, ClockError> {
        let Some(path) = self.path.clone() else {
            self.value = step(self.value).ok_or(ClockError::Overflow { value: self.value })?;
            return Ok(self.value);
        };

        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let _lock = WriterLock::acquire(&path.with_file_name(lock_name), DEFAULT_LOCK_TIMEOUT)?;

        let on_disk = read_state(&path)?.map_or(0, |state| state.value);
        let current = self.value.max(on_disk);
        let next = step(current).ok_or(ClockError::Overflow { value: current })?;

        let state = ClockState {
            value: next,
            node_id: self.node_id.clone(),
        };
        let body = serde_json::to_vec(&state).map_err(|source| ClockError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &body).map_err(|source| ClockError::Io {
            path: path.clone(),
            source,
        })?;

        self.value = next;
        Ok(next)
    }
}

fn read_state(path: &Path) -> Result<Option<ClockState>, ClockError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ClockError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| ClockError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Stable 12-hex-digit identity for this host and user.
#[must_use]
pub fn node_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .unwrap_or_default();
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    node_id_for(host.trim(), user.trim())
}

fn node_id_for(host: &str, user: &str) -> String {
    let digest = blake3::hash(format!("{host}\u{0}{user}").as_bytes());
    digest.to_hex()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn receive_takes_max_plus_one() {
        let mut clock = LamportClock::in_memory(5, "node-a");
        assert_eq!(clock.receive(42).unwrap(), 43);
        assert_eq!(clock.receive(10).unwrap(), 44);
        assert_eq!(clock.tick().unwrap(), 45);
    }

    #[test]
    fn missing_file_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let clock = LamportClock::load_in(dir.path()).unwrap();
        assert_eq!(clock.value(), 0);
        assert_eq!(clock.node_id().len(), 12);
    }

    #[test]
    fn persisted_value_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut clock = LamportClock::load_in(dir.path()).unwrap();
        clock.tick().unwrap();
        clock.receive(100).unwrap();

        let reloaded = LamportClock::load_in(dir.path()).unwrap();
        assert_eq!(reloaded.value(), 102);
        assert_eq!(reloaded.node_id(), clock.node_id());
        assert!(!dir.path().join("clock.json.tmp").exists());
    }

    #[test]
    fn two_handles_on_one_file_never_repeat() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = LamportClock::load_in(dir.path()).unwrap();
        let mut b = LamportClock::load_in(dir.path()).unwrap();
        let first = a.tick().unwrap();
        let second = b.tick().unwrap();
        assert!(second > first);
    }

    #[test]
    fn corrupt_state_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CLOCK_FILE), "not json").unwrap();
        let err = LamportClock::load_in(dir.path()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ClockPersistFailed);
    }

    #[test]
    fn failed_persist_leaves_value_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut clock = LamportClock::load_in(dir.path()).unwrap();
        clock.tick().unwrap();
        fs::write(dir.path().join(CLOCK_FILE), "garbage").unwrap();

        assert!(clock.tick().is_err());
        assert_eq!(clock.value(), 1);
    }

    #[test]
    fn remote_at_max_is_rejected_without_moving() {
        let mut clock = LamportClock::in_memory(5, "node-a");
        let err = clock.receive(u64::MAX).unwrap_err();
        assert!(matches!(err, ClockError::Overflow { value: 5 }));
        assert_eq!(err.code(), ErrorCode::ClockOverflow);
        assert_eq!(clock.value(), 5);

        // Just below the edge still works.
        assert_eq!(clock.receive(u64::MAX - 1).unwrap(), u64::MAX);
    }

    #[test]
    fn tick_at_max_is_rejected_without_moving() {
        let mut clock = LamportClock::in_memory(u64::MAX, "node-a");
        assert!(matches!(clock.tick(), Err(ClockError::Overflow { .. })));
        assert_eq!(clock.value(), u64::MAX);
    }

    #[test]
    fn overflow_leaves_persisted_value_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut clock = LamportClock::load_in(dir.path()).unwrap();
        clock.tick().unwrap();

        assert!(matches!(
            clock.receive(u64::MAX),
            Err(ClockError::Overflow { value: 1 })
        ));
        assert_eq!(LamportClock::load_in(dir.path()).unwrap().value(), 1);
    }

    #[test]
    fn node_id_is_stable_hex() {
        let id = node_id_for("build-01", "ci");
        assert_eq!(id, node_id_for("build-01", "ci"));
        assert_ne!(id, node_id_for("build-02", "ci"));
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    proptest! {
        #[test]
        fn strictly_increasing(start in 0u64..1_000_000, ops in prop::collection::vec(prop::option::of(0u64..2_000_000), 1..64)) {
            let mut clock = LamportClock::in_memory(start, "prop");
            let mut prev = clock.value();
            for op in ops {
                let next = match op {
                    Some(remote) => {
                        let next = clock.receive(remote).unwrap();
                        prop_assert!(next > remote);
                        next
                    }
                    None => clock.tick().unwrap(),
                };
                prop_assert!(next > prev);
                prev = next;
            }
        }
    }
}
