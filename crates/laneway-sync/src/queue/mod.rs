//! Durable, capacity-bounded offline queue backed by SQLite.
//!
//! Runtime defaults follow the status store's other SQLite users:
//! - `journal_mode = WAL` so a reader (stats, the daemon) never blocks the
//!   foreground enqueue
//! - `busy_timeout = 5s` to ride out short contention
//! - every write runs in an `IMMEDIATE` transaction, so the capacity check
//!   and the insert see the same row count
//!
//! Rows leave the queue only through [`OfflineQueue::mark_synced`] or
//! [`OfflineQueue::clear`].
//!
//! Queue order is insertion order (`rowid`). The stored enqueue time is only
//! reported, never sorted on, since the wall clock may step backwards.

pub mod schema;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use laneway_core::error::ErrorCode;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::envelope::SyncEvent;

/// Default capacity. Enqueue beyond this is refused, never dropped.
pub const MAX_QUEUE_SIZE: usize = 10_000;

/// File name of the queue database under the laneway home directory.
pub const QUEUE_FILE: &str = "queue.db";

/// Busy timeout used for queue connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const TOP_EVENT_TYPES: i64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cannot create queue directory {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode event {event_id}: {source}")]
    Encode {
        event_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("queued event {event_id} holds invalid JSON: {source}")]
    Decode {
        event_id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl QueueError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::QueueStorageFailed
    }
}

/// One undelivered event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub event_id: String,
    pub event_type: String,
    /// Full envelope, exactly as it goes on the wire.
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total_queued: usize,
    /// Entries with at least one failed delivery.
    pub total_retried: usize,
    pub oldest_event_age: Option<Duration>,
    /// Buckets `"0"`, `"1-3"`, and `"4+"`, always present.
    pub retry_distribution: BTreeMap<String, usize>,
    /// Up to five `(event_type, count)` pairs, most frequent first.
    pub top_event_types: Vec<(String, usize)>,
}

pub struct OfflineQueue {
    conn: Connection,
    max_size: usize,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("path", &self.conn.path())
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl OfflineQueue {
    /// Open (or create) the queue database and migrate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or SQLite fails
    /// to open, configure, or migrate the database.
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| QueueError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// [`OfflineQueue::open`] on `<home>/queue.db`.
    ///
    /// # Errors
    ///
    /// Same as [`OfflineQueue::open`].
    pub fn open_in(home: &Path) -> Result<Self, QueueError> {
        Self::open(&home.join(QUEUE_FILE))
    }

    /// Private in-memory queue, for tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot create the schema.
    pub fn open_in_memory() -> Result<Self, QueueError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, QueueError> {
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let _journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        schema::migrate(&mut conn)?;
        Ok(Self {
            conn,
            max_size: MAX_QUEUE_SIZE,
        })
    }

    #[must_use]
    pub const fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Insert or update an event by `event_id`.
    ///
    /// An update keeps the row's queue position and retry count. Returns
    /// `false`, writing nothing, when the event is new and the queue is full.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be encoded or SQLite fails.
    pub fn enqueue(&mut self, event: &SyncEvent) -> Result<bool, QueueError> {
        self.enqueue_at(event, Utc::now())
    }

    fn enqueue_at(
        &mut self,
        event: &SyncEvent,
        enqueued_at: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let data = serde_json::to_string(event).map_err(|source| QueueError::Encode {
            event_id: event.event_id.clone(),
            source,
        })?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists = tx
            .query_row(
                "SELECT 1 FROM queue WHERE event_id = ?1",
                [&event.event_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        if !exists {
            let size: i64 = tx.query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?;
            if usize::try_from(size).unwrap_or(usize::MAX) >= self.max_size {
                warn!(
                    event_id = %event.event_id,
                    max = self.max_size,
                    "offline queue full; event not enqueued"
                );
                return Ok(false);
            }
        }

        tx.execute(
            "INSERT INTO queue (event_id, event_type, data, timestamp, retry_count)
             VALUES (?1, ?2, ?3, ?4, 0)
             ON CONFLICT(event_id) DO UPDATE SET
                 event_type = excluded.event_type,
                 data = excluded.data",
            params![
                event.event_id,
                event.event_type,
                data,
                enqueued_at.timestamp_micros()
            ],
        )?;
        tx.commit()?;
        debug!(event_id = %event.event_id, updated = exists, "enqueued sync event");
        Ok(true)
    }

    /// Oldest-first peek at up to `limit` entries. Nothing is removed.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite fails or a row holds invalid JSON.
    pub fn drain(&self, limit: Option<usize>) -> Result<Vec<QueueEntry>, QueueError> {
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        self.select(
            "SELECT event_id, event_type, data, timestamp, retry_count
             FROM queue ORDER BY rowid LIMIT ?1",
            limit,
        )
    }

    /// Entries that have failed at least `min_retries` times, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite fails or a row holds invalid JSON.
    pub fn by_retry_count(&self, min_retries: u32) -> Result<Vec<QueueEntry>, QueueError> {
        self.select(
            "SELECT event_id, event_type, data, timestamp, retry_count
             FROM queue WHERE retry_count >= ?1 ORDER BY rowid",
            i64::from(min_retries),
        )
    }

    fn select(&self, sql: &str, arg: i64) -> Result<Vec<QueueEntry>, QueueError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map([arg], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(event_id, event_type, data, micros, retries)| {
                let payload = serde_json::from_str(&data).map_err(|source| QueueError::Decode {
                    event_id: event_id.clone(),
                    source,
                })?;
                Ok(QueueEntry {
                    event_id,
                    event_type,
                    payload,
                    enqueued_at: from_micros(micros),
                    retry_count: u32::try_from(retries).unwrap_or(u32::MAX),
                })
            })
            .collect()
    }

    /// Remove delivered events. Unknown ids are ignored; empty input is a
    /// no-op. Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite fails; no row is removed in that case.
    pub fn mark_synced(&mut self, event_ids: &[String]) -> Result<usize, QueueError> {
        self.for_each_id(event_ids, "DELETE FROM queue WHERE event_id = ?1")
    }

    /// Bump `retry_count` of each listed event. Returns rows touched.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite fails; no row is changed in that case.
    pub fn increment_retry(&mut self, event_ids: &[String]) -> Result<usize, QueueError> {
        self.for_each_id(
            event_ids,
            "UPDATE queue SET retry_count = retry_count + 1 WHERE event_id = ?1",
        )
    }

    fn for_each_id(&mut self, event_ids: &[String], sql: &str) -> Result<usize, QueueError> {
        if event_ids.is_empty() {
            return Ok(0);
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(sql)?;
            for event_id in event_ids {
                changed += stmt.execute([event_id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// # Errors
    ///
    /// Returns an error if SQLite fails.
    pub fn size(&self) -> Result<usize, QueueError> {
        let size: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?;
        Ok(usize::try_from(size).unwrap_or(0))
    }

    /// Drop every entry. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite fails.
    pub fn clear(&mut self) -> Result<usize, QueueError> {
        let removed = self.conn.execute("DELETE FROM queue", [])?;
        warn!(removed, "offline queue cleared");
        Ok(removed)
    }

    /// # Errors
    ///
    /// Returns an error if SQLite fails.
    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let (total, retried, oldest): (i64, i64, Option<i64>) = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN retry_count > 0 THEN 1 ELSE 0 END), 0),
                    MIN(timestamp)
             FROM queue",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut retry_distribution: BTreeMap<String, usize> = ["0", "1-3", "4+"]
            .into_iter()
            .map(|bucket| (bucket.to_string(), 0))
            .collect();
        let mut stmt = self.conn.prepare(
            "SELECT CASE
                        WHEN retry_count = 0 THEN '0'
                        WHEN retry_count <= 3 THEN '1-3'
                        ELSE '4+'
                    END AS bucket,
                    COUNT(*)
             FROM queue GROUP BY bucket",
        )?;
        for row in stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))? {
            let (bucket, count) = row?;
            retry_distribution.insert(bucket, to_usize(count));
        }

        let mut stmt = self.conn.prepare(
            "SELECT event_type, COUNT(*) AS n FROM queue
             GROUP BY event_type ORDER BY n DESC, event_type LIMIT ?1",
        )?;
        let top_event_types = stmt
            .query_map([TOP_EVENT_TYPES], |row| {
                Ok((row.get::<_, String>(0)?, to_usize(row.get::<_, i64>(1)?)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let oldest_event_age = oldest.map(|micros| {
            (Utc::now() - from_micros(micros))
                .to_std()
                .unwrap_or(Duration::ZERO)
        });

        Ok(QueueStats {
            total_queued: to_usize(total),
            total_retried: to_usize(retried),
            oldest_event_age,
            retry_distribution,
            top_event_types,
        })
    }
}

fn to_usize(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(micros).single().unwrap_or_default()
}
