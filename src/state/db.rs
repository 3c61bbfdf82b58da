//! Connection plumbing shared by the SQLite-backed stores.
//!
//! Each store owns one `Mutex<Connection>`: the mutex is the store's serial
//! queue, so operations on a store run one at a time in submission order.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

use super::error::StateError;
use super::schema;

/// Open (or create) the database file, apply pragmas and migrate.
///
/// Runs on the blocking pool since opening and migrating touch the disk.
pub(crate) async fn open_connection(path: &Path) -> Result<Connection, StateError> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let conn = Connection::open(&path).map_err(|e| StateError::Open {
            path: path.clone(),
            source: e,
        })?;

        // WAL lets several store connections read while one writes.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(StateError::Migration)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(StateError::Migration)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(StateError::Migration)?;

        schema::migrate(&conn)?;
        Ok::<_, StateError>(conn)
    })
    .await?
}

/// Open a migrated in-memory database (for tests).
#[cfg(test)]
pub(crate) fn open_memory() -> Result<Connection, StateError> {
    let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
        path: PathBuf::from(":memory:"),
        source: e,
    })?;
    schema::migrate(&conn)?;
    Ok(conn)
}

/// Take the store's connection.
pub(crate) fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StateError> {
    conn.lock().map_err(|e| StateError::Query(e.to_string()))
}

/// Run `body` inside one transaction, committing on success and rolling
/// back on any error.
pub(crate) fn in_transaction<T>(
    conn: &Connection,
    body: impl FnOnce(&Connection) -> Result<T, StateError>,
) -> Result<T, StateError> {
    conn.execute("BEGIN TRANSACTION", [])
        .map_err(StateError::query)?;

    match body(conn) {
        Ok(value) => {
            conn.execute("COMMIT", []).map_err(StateError::query)?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(e)
        }
    }
}

/// Timestamps are stored as Unix milliseconds.
pub(crate) fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

pub(crate) fn from_millis_opt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}
