//! Append-only, per-feature status event log.
//!
//! # Directory Layout
//!
//! ```text
//! <features_root>/
//!   <feature_slug>/
//!     status.events.jsonl   # authoritative, append-only
//!     status.json           # disposable snapshot (see `snapshot`)
//!     .status.lock          # single-writer advisory lock
//! ```
//!
//! # Invariants
//!
//! - Order is append position. Embedded timestamps are never consulted.
//! - Each append is `O_APPEND` + `write_all` + `flush` + `sync_data` under the
//!   writer lock, so a returned `Ok` means the line is durable. A batch goes
//!   out as one buffer; a failed write truncates the log back to where the
//!   batch started.
//! - A torn trailing line left by a crash is repaired before the next append.
//! - Reads tolerate one malformed *trailing* line, including one cut inside a
//!   multibyte character; anything earlier is corruption and fails the read.

use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::str::{self, Utf8Error};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ErrorCode;
use crate::event::StatusEvent;
use crate::lock::{DEFAULT_LOCK_TIMEOUT, LockError, WriterLock};

/// File name of the authoritative event log inside a feature directory.
pub const EVENTS_FILE: &str = "status.events.jsonl";

/// File name of the materialized snapshot inside a feature directory.
pub const SNAPSHOT_FILE: &str = "status.json";

const LOCK_FILE: &str = ".status.lock";

/// Errors raised by the event log store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("status log I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("invalid feature slug '{0}'")]
    InvalidFeature(String),

    #[error("event {event_id} belongs to feature '{event}', not '{log}'")]
    FeatureMismatch {
        event_id: String,
        event: String,
        log: String,
    },

    #[error("failed to serialize event {event_id}: {source}")]
    Serialize {
        event_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode snapshot for '{feature}': {source}")]
    SnapshotEncode {
        feature: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt status log {} at line {line}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("status log {} is not UTF-8 at line {line}: {source}", .path.display())]
    NotUtf8 {
        path: PathBuf,
        line: usize,
        #[source]
        source: Utf8Error,
    },
}

impl StoreError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } | Self::Serialize { .. } => ErrorCode::EventLogWriteFailed,
            Self::Lock(err) => err.code(),
            Self::InvalidFeature(_) | Self::FeatureMismatch { .. } => ErrorCode::FeatureMismatch,
            Self::SnapshotEncode { .. } => ErrorCode::SnapshotWriteFailed,
            Self::Corrupt { .. } | Self::NotUtf8 { .. } => ErrorCode::CorruptEventLog,
        }
    }
}

pub(crate) fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Handle on the directory holding every feature's status log.
///
/// Cheap to construct; holds no open files between calls.
#[derive(Debug, Clone)]
pub struct EventLogStore {
    features_root: PathBuf,
    lock_timeout: Duration,
}

impl EventLogStore {
    #[must_use]
    pub fn new(features_root: impl Into<PathBuf>) -> Self {
        Self {
            features_root: features_root.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Override how long an append waits for a contended writer lock.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub fn features_root(&self) -> &Path {
        &self.features_root
    }

    #[must_use]
    pub fn feature_dir(&self, feature_slug: &str) -> PathBuf {
        self.features_root.join(feature_slug)
    }

    #[must_use]
    pub fn events_path(&self, feature_slug: &str) -> PathBuf {
        self.feature_dir(feature_slug).join(EVENTS_FILE)
    }

    #[must_use]
    pub fn snapshot_path(&self, feature_slug: &str) -> PathBuf {
        self.feature_dir(feature_slug).join(SNAPSHOT_FILE)
    }

    fn lock_path(&self, feature_slug: &str) -> PathBuf {
        self.feature_dir(feature_slug).join(LOCK_FILE)
    }

    /// Append one event to the feature's log and make it durable.
    ///
    /// This performs no lane validation; callers that need structural checks
    /// go through [`crate::emit::emit_transition`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FeatureMismatch`] if the event names another
    /// feature, [`StoreError::Lock`] on writer contention, and
    /// [`StoreError::Io`] if any write, flush, or sync fails.
    pub fn append_event(&self, feature_slug: &str, event: &StatusEvent) -> Result<(), StoreError> {
        let _lock = self.lock_feature(feature_slug)?;
        self.write_events(feature_slug, std::slice::from_ref(event))
    }

    /// Read the log, build an event from it, and append that event, all
    /// under the feature's writer lock.
    ///
    /// No other writer can append between the read and the write, so `build`
    /// sees exactly the state its event will follow.
    ///
    /// # Errors
    ///
    /// Returns whatever `build` rejects with, or any store error from the
    /// read or the append.
    pub fn append_with<E, F>(&self, feature_slug: &str, build: F) -> Result<StatusEvent, E>
    where
        E: From<StoreError>,
        F: FnOnce(&[StatusEvent]) -> Result<StatusEvent, E>,
    {
        let _lock = self.lock_feature(feature_slug)?;
        let events = self.read_events(feature_slug)?;
        let event = build(&events)?;
        self.write_events(feature_slug, std::slice::from_ref(&event))?;
        Ok(event)
    }

    /// [`EventLogStore::append_with`] for several events: `build` sees the
    /// log once and every event it returns is appended, in order, before the
    /// lock is released. Nothing is written if `build` fails, if any event
    /// names another feature, or if the write itself fails.
    ///
    /// # Errors
    ///
    /// Same as [`EventLogStore::append_with`].
    pub fn append_all_with<E, F>(
        &self,
        feature_slug: &str,
        build: F,
    ) -> Result<Vec<StatusEvent>, E>
    where
        E: From<StoreError>,
        F: FnOnce(&[StatusEvent]) -> Result<Vec<StatusEvent>, E>,
    {
        let _lock = self.lock_feature(feature_slug)?;
        let existing = self.read_events(feature_slug)?;
        let events = build(&existing)?;
        self.write_events(feature_slug, &events)?;
        Ok(events)
    }

    fn lock_feature(&self, feature_slug: &str) -> Result<WriterLock, StoreError> {
        validate_slug(feature_slug)?;
        let dir = self.feature_dir(feature_slug);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(WriterLock::acquire(
            &self.lock_path(feature_slug),
            self.lock_timeout,
        )?)
    }

    /// Caller holds the writer lock.
    fn write_events(&self, feature_slug: &str, events: &[StatusEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut buf = String::new();
        for event in events {
            if event.feature_slug != feature_slug {
                return Err(StoreError::FeatureMismatch {
                    event_id: event.event_id.to_string(),
                    event: event.feature_slug.clone(),
                    log: feature_slug.to_string(),
                });
            }
            let line = event.to_json_line().map_err(|source| StoreError::Serialize {
                event_id: event.event_id.to_string(),
                source,
            })?;
            buf.push_str(&line);
            buf.push('\n');
        }

        let path = self.events_path(feature_slug);
        repair_torn_tail(&path).map_err(io_err(&path))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        let start = file.metadata().map_err(io_err(&path))?.len();

        let written = file
            .write_all(buf.as_bytes())
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_data());
        if let Err(err) = written {
            if let Err(undo) = file.set_len(start).and_then(|()| file.sync_data()) {
                warn!(
                    path = %path.display(),
                    error = %undo,
                    "could not roll back partial status log append"
                );
            }
            return Err(io_err(&path)(err));
        }

        for event in events {
            debug!(
                feature = feature_slug,
                event_id = %event.event_id,
                wp_id = %event.wp_id,
                "appended status event"
            );
        }
        Ok(())
    }

    /// Read every event of a feature in append order.
    ///
    /// A missing log reads as empty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file exists but cannot be read, and
    /// [`StoreError::Corrupt`] or [`StoreError::NotUtf8`] if a line other
    /// than the last is malformed.
    pub fn read_events(&self, feature_slug: &str) -> Result<Vec<StatusEvent>, StoreError> {
        validate_slug(feature_slug)?;
        let path = self.events_path(feature_slug);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(&path)(err)),
        };
        parse_log(&path, &content)
    }

    /// Slugs of every feature directory that currently holds a log, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the features root exists but cannot be
    /// listed.
    pub fn list_features(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.features_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(&self.features_root)(err)),
        };

        let mut slugs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.features_root))?;
            if !entry.path().join(EVENTS_FILE).is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                slugs.push(name.to_string());
            }
        }
        slugs.sort();
        Ok(slugs)
    }
}

/// Replace `path` with `bytes` via a synced sibling temp file and a rename.
///
/// # Errors
///
/// Returns any I/O error from creating, writing, syncing, or renaming.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}

pub(crate) fn validate_slug(feature_slug: &str) -> Result<(), StoreError> {
    let bad = feature_slug.trim().is_empty()
        || feature_slug.contains(['/', '\\'])
        || feature_slug == "."
        || feature_slug == "..";
    if bad {
        return Err(StoreError::InvalidFeature(feature_slug.to_string()));
    }
    Ok(())
}

fn parse_log(path: &Path, content: &[u8]) -> Result<Vec<StatusEvent>, StoreError> {
    let lines: Vec<(usize, &[u8])> = content
        .split(|&b| b == b'\n')
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim_ascii()))
        .filter(|(_, line)| !line.is_empty())
        .collect();
    let last_line = lines.last().map(|(line_no, _)| *line_no);

    let mut events = Vec::with_capacity(lines.len());
    for (line_no, line) in lines {
        match parse_line(path, line_no, line) {
            Ok(event) => events.push(event),
            Err(err) if Some(line_no) == last_line => {
                warn!(
                    path = %path.display(),
                    line = line_no,
                    error = %err,
                    "skipping malformed trailing status event line"
                );
            }
            Err(err) => return Err(err),
        }
    }
    Ok(events)
}

fn parse_line(path: &Path, line_no: usize, line: &[u8]) -> Result<StatusEvent, StoreError> {
    let text = str::from_utf8(line).map_err(|source| StoreError::NotUtf8 {
        path: path.to_path_buf(),
        line: line_no,
        source,
    })?;
    StatusEvent::from_json_line(text).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        line: line_no,
        source,
    })
}

/// Make sure the next append starts on a fresh line.
///
/// An unterminated tail that still parses as an event is kept and terminated;
/// anything else is a torn write and is truncated. Returns the number of bytes
/// removed, if any.
fn repair_torn_tail(path: &Path) -> io::Result<Option<u64>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    if bytes.is_empty() || bytes.ends_with(b"\n") {
        return Ok(None);
    }

    let keep = bytes
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos + 1);
    let tail = &bytes[keep..];

    let parses = str::from_utf8(tail)
        .ok()
        .is_some_and(|text| StatusEvent::from_json_line(text.trim()).is_ok());

    if parses {
        let mut file = OpenOptions::new().append(true).open(path)?;
        file.write_all(b"\n")?;
        file.sync_data()?;
        return Ok(None);
    }

    let removed = (bytes.len() - keep) as u64;
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    file.sync_data()?;
    warn!(
        path = %path.display(),
        bytes = removed,
        "truncated torn trailing write in status log"
    );
    Ok(Some(removed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::Lane;
    use tempfile::TempDir;

    const FEATURE: &str = "034-auth-retry";

    fn setup() -> (TempDir, EventLogStore) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = EventLogStore::new(dir.path().join("features"));
        (dir, store)
    }

    fn event(wp: &str, from: Lane, to: Lane) -> StatusEvent {
        StatusEvent::transition(FEATURE, wp, from, to, "agent-1")
    }

    #[test]
    fn paths_follow_layout() {
        let (dir, store) = setup();
        assert_eq!(
            store.events_path(FEATURE),
            dir.path().join("features").join(FEATURE).join(EVENTS_FILE)
        );
        assert_eq!(
            store.snapshot_path(FEATURE),
            dir.path().join("features").join(FEATURE).join(SNAPSHOT_FILE)
        );
    }

    #[test]
    fn read_missing_log_is_empty() {
        let (_dir, store) = setup();
        assert!(store.read_events(FEATURE).expect("read").is_empty());
    }

    #[test]
    fn append_then_read_preserves_order() {
        let (_dir, store) = setup();
        let first = event("WP02", Lane::Planned, Lane::Claimed);
        let second = event("WP01", Lane::Planned, Lane::Claimed);
        store.append_event(FEATURE, &first).expect("append first");
        store.append_event(FEATURE, &second).expect("append second");

        let events = store.read_events(FEATURE).expect("read");
        assert_eq!(events, vec![first, second]);
    }

    #[test]
    fn each_line_is_one_sorted_object() {
        let (_dir, store) = setup();
        store
            .append_event(FEATURE, &event("WP01", Lane::Planned, Lane::Claimed))
            .expect("append");
        let raw = fs::read_to_string(store.events_path(FEATURE)).expect("read raw");
        assert_eq!(raw.lines().count(), 1);
        assert!(raw.ends_with('\n'));
        assert!(raw.starts_with("{\"actor\":"));
    }

    #[test]
    fn append_rejects_foreign_feature() {
        let (_dir, store) = setup();
        let foreign = StatusEvent::transition("other", "WP01", Lane::Planned, Lane::Claimed, "a");
        let err = store.append_event(FEATURE, &foreign).unwrap_err();
        assert!(matches!(err, StoreError::FeatureMismatch { .. }));
        assert_eq!(err.code(), ErrorCode::FeatureMismatch);
        assert!(!store.events_path(FEATURE).exists());
    }

    #[test]
    fn append_with_sees_prior_events_and_can_refuse() {
        let (_dir, store) = setup();
        store
            .append_event(FEATURE, &event("WP01", Lane::Planned, Lane::Claimed))
            .unwrap();

        let appended: Result<StatusEvent, StoreError> = store.append_with(FEATURE, |events| {
            assert_eq!(events.len(), 1);
            Ok(event("WP01", Lane::Claimed, Lane::InProgress))
        });
        assert_eq!(appended.unwrap().to_lane, Lane::InProgress);

        let refused: Result<StatusEvent, StoreError> = store.append_with(FEATURE, |_| {
            Err(StoreError::InvalidFeature("refused".into()))
        });
        assert!(refused.is_err());
        assert_eq!(store.read_events(FEATURE).unwrap().len(), 2);
    }

    #[test]
    fn append_all_with_writes_everything_or_nothing() {
        let (_dir, store) = setup();
        let written: Result<Vec<StatusEvent>, StoreError> = store.append_all_with(FEATURE, |_| {
            Ok(vec![
                event("WP01", Lane::Planned, Lane::Claimed),
                event("WP02", Lane::Planned, Lane::Claimed),
            ])
        });
        assert_eq!(written.unwrap().len(), 2);

        let refused: Result<Vec<StatusEvent>, StoreError> = store.append_all_with(FEATURE, |events| {
            assert_eq!(events.len(), 2);
            Err(StoreError::InvalidFeature("refused".into()))
        });
        assert!(refused.is_err());
        assert_eq!(store.read_events(FEATURE).unwrap().len(), 2);
    }

    #[test]
    fn append_all_with_rejects_batch_with_one_foreign_event() {
        let (_dir, store) = setup();
        let foreign = StatusEvent::transition("other", "WP02", Lane::Planned, Lane::Claimed, "a");
        let result: Result<Vec<StatusEvent>, StoreError> = store.append_all_with(FEATURE, |_| {
            Ok(vec![event("WP01", Lane::Planned, Lane::Claimed), foreign])
        });

        assert!(matches!(result, Err(StoreError::FeatureMismatch { .. })));
        assert!(store.read_events(FEATURE).unwrap().is_empty());
    }

    #[test]
    fn batch_append_is_a_single_contiguous_write() {
        let (_dir, store) = setup();
        let batch = vec![
            event("WP01", Lane::Planned, Lane::Claimed),
            event("WP02", Lane::Planned, Lane::Claimed),
            event("WP03", Lane::Planned, Lane::Claimed),
        ];
        let expected = batch.clone();
        let written: Result<Vec<StatusEvent>, StoreError> =
            store.append_all_with(FEATURE, move |_| Ok(batch));
        assert_eq!(written.unwrap(), expected);

        let raw = fs::read_to_string(store.events_path(FEATURE)).unwrap();
        assert_eq!(raw.lines().count(), 3);
        assert_eq!(store.read_events(FEATURE).unwrap(), expected);
    }

    #[test]
    fn invalid_slug_rejected() {
        let (_dir, store) = setup();
        assert!(matches!(
            store.read_events("../escape"),
            Err(StoreError::InvalidFeature(_))
        ));
    }

    #[test]
    fn malformed_trailing_line_is_skipped() {
        let (_dir, store) = setup();
        let kept = event("WP01", Lane::Planned, Lane::Claimed);
        store.append_event(FEATURE, &kept).expect("append");

        let mut file = OpenOptions::new()
            .append(true)
            .open(store.events_path(FEATURE))
            .expect("open");
        file.write_all(b"{\"actor\":\"half").expect("torn write");

        let events = store.read_events(FEATURE).expect("lenient read");
        assert_eq!(events, vec![kept]);
    }

    #[test]
    fn torn_multibyte_trailing_line_is_skipped() {
        let (_dir, store) = setup();
        let kept = event("WP01", Lane::Planned, Lane::Claimed);
        store.append_event(FEATURE, &kept).expect("append");

        let mut file = OpenOptions::new()
            .append(true)
            .open(store.events_path(FEATURE))
            .expect("open");
        // First byte of a two-byte UTF-8 sequence, cut off by the crash.
        file.write_all(b"{\"actor\":\"\xC3").expect("torn write");

        let events = store.read_events(FEATURE).expect("lenient read");
        assert_eq!(events, vec![kept.clone()]);

        let next = event("WP01", Lane::Claimed, Lane::InProgress);
        store.append_event(FEATURE, &next).expect("append after tear");
        assert_eq!(store.read_events(FEATURE).unwrap(), vec![kept, next]);
    }

    #[test]
    fn invalid_utf8_in_middle_line_is_corruption() {
        let (_dir, store) = setup();
        let path = store.events_path(FEATURE);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let good = event("WP01", Lane::Planned, Lane::Claimed)
            .to_json_line()
            .unwrap();
        let mut raw = format!("{good}\n").into_bytes();
        raw.extend_from_slice(b"{\"actor\":\"\xC3\"}\n");
        raw.extend_from_slice(format!("{good}\n").as_bytes());
        fs::write(&path, raw).unwrap();

        let err = store.read_events(FEATURE).unwrap_err();
        assert!(matches!(err, StoreError::NotUtf8 { line: 2, .. }));
        assert_eq!(err.code(), ErrorCode::CorruptEventLog);
    }

    #[test]
    fn malformed_middle_line_is_corruption() {
        let (_dir, store) = setup();
        let path = store.events_path(FEATURE);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let good = event("WP01", Lane::Planned, Lane::Claimed)
            .to_json_line()
            .unwrap();
        fs::write(&path, format!("{good}\nnot json\n{good}\n")).unwrap();

        let err = store.read_events(FEATURE).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { line: 2, .. }));
        assert_eq!(err.code(), ErrorCode::CorruptEventLog);
    }

    #[test]
    fn append_after_torn_write_truncates_fragment() {
        let (_dir, store) = setup();
        let first = event("WP01", Lane::Planned, Lane::Claimed);
        store.append_event(FEATURE, &first).expect("append");
        let mut file = OpenOptions::new()
            .append(true)
            .open(store.events_path(FEATURE))
            .unwrap();
        file.write_all(b"{\"actor\":\"torn").unwrap();

        let second = event("WP01", Lane::Claimed, Lane::InProgress);
        store.append_event(FEATURE, &second).expect("append after tear");

        assert_eq!(store.read_events(FEATURE).unwrap(), vec![first, second]);
    }

    #[test]
    fn unterminated_valid_tail_is_kept() {
        let (_dir, store) = setup();
        let path = store.events_path(FEATURE);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let first = event("WP01", Lane::Planned, Lane::Claimed);
        fs::write(&path, first.to_json_line().unwrap()).unwrap();

        let second = event("WP01", Lane::Claimed, Lane::InProgress);
        store.append_event(FEATURE, &second).expect("append");
        assert_eq!(store.read_events(FEATURE).unwrap(), vec![first, second]);
    }

    #[test]
    fn list_features_only_reports_logs() {
        let (_dir, store) = setup();
        store
            .append_event(FEATURE, &event("WP01", Lane::Planned, Lane::Claimed))
            .unwrap();
        fs::create_dir_all(store.feature_dir("empty-feature")).unwrap();
        assert_eq!(store.list_features().unwrap(), vec![FEATURE.to_string()]);
    }
}
