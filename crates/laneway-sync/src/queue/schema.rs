//! SQLite schema for the offline queue.
//!
//! - `queue` holds one row per undelivered event, keyed by `event_id`
//! - `timestamp` is enqueue time in microseconds, kept for stats; FIFO
//!   order is `rowid`, which an upsert leaves untouched
//! - `data` is the full envelope JSON exactly as it will be sent

use rusqlite::{Connection, types::Type};
use tracing::{debug, warn};

/// Latest schema version understood by this build.
pub const LATEST_SCHEMA_VERSION: u32 = 2;

/// Migration v1: the queue table.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS queue (
    event_id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    data TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0)
);
";

/// Migration v2: indexes for FIFO drain and retry queries.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_queue_timestamp ON queue(timestamp);
CREATE INDEX IF NOT EXISTS idx_queue_retry_count ON queue(retry_count);
";

/// Indexes the queue relies on.
pub const REQUIRED_INDEXES: &[&str] = &["idx_queue_timestamp", "idx_queue_retry_count"];

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "queue table",
        sql: MIGRATION_V1_SQL,
    },
    Migration {
        version: 2,
        name: "queue indexes",
        sql: MIGRATION_V2_SQL,
    },
];

/// Schema version recorded in `PRAGMA user_version`.
///
/// # Errors
///
/// Returns an error if querying SQLite fails or the value is negative.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let raw: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(err)))
}

/// Bring the queue schema up to [`LATEST_SCHEMA_VERSION`].
///
/// Each step runs in its own transaction together with its `user_version`
/// bump. A database written by a newer build is left alone.
///
/// # Errors
///
/// Returns an error if any step fails; earlier steps stay committed.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let start = current_schema_version(conn)?;
    if start > LATEST_SCHEMA_VERSION {
        warn!(
            found = start,
            supported = LATEST_SCHEMA_VERSION,
            "queue schema is newer than this build"
        );
        return Ok(start);
    }

    let pending = MIGRATIONS.iter().filter(|step| step.version > start);
    let mut version = start;
    for step in pending {
        let tx = conn.transaction()?;
        tx.execute_batch(step.sql)?;
        tx.pragma_update(None, "user_version", i64::from(step.version))?;
        tx.commit()?;
        debug!(version = step.version, name = step.name, "applied queue migration");
        version = step.version;
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn object_exists(conn: &Connection, kind: &str, name: &str) -> rusqlite::Result<bool> {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2)",
            params![kind, name],
            |row| row.get(0),
        )
    }

    #[test]
    fn migrate_empty_db_to_latest() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);
        assert!(object_exists(&conn, "table", "queue")?);
        for index in REQUIRED_INDEXES {
            assert!(object_exists(&conn, "index", index)?, "missing index {index}");
        }
        Ok(())
    }

    #[test]
    fn newer_schema_is_left_alone() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "user_version", 9)?;
        assert_eq!(migrate(&mut conn)?, 9);
        assert!(!object_exists(&conn, "table", "queue")?);
        Ok(())
    }

    #[test]
    fn migrate_is_idempotent() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);
        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);
        assert_eq!(current_schema_version(&conn)?, LATEST_SCHEMA_VERSION);
        Ok(())
    }
}
