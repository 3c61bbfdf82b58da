//! Database schema definitions and migrations.
//!
//! Every table has exactly one owning store; the DDL is grouped by owner so
//! a store never touches another store's tables.

use rusqlite::Connection;

use super::error::StateError;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Owned by `SqliteUploadHistory`.
const UPLOAD_HISTORY_V1: &str = r#"
CREATE TABLE IF NOT EXISTS uploaded_assets (
    asset_id TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    filename TEXT NOT NULL,
    remote_id TEXT NOT NULL,
    uploaded_at INTEGER NOT NULL,
    file_size INTEGER NOT NULL DEFAULT 0,
    is_duplicate INTEGER NOT NULL DEFAULT 0,
    is_favorite INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (asset_id, resource_type)
);
"#;

/// Owned by `SqliteHashCache`.
const HASH_CACHE_V1: &str = r#"
CREATE TABLE IF NOT EXISTS hash_cache (
    asset_id TEXT PRIMARY KEY NOT NULL,
    primary_hash TEXT NOT NULL,
    raw_hash TEXT,
    has_raw INTEGER NOT NULL DEFAULT 0,
    primary_on_server INTEGER NOT NULL DEFAULT 0,
    raw_on_server INTEGER NOT NULL DEFAULT 0,
    calculated_at INTEGER NOT NULL,
    checked_at INTEGER,
    raw_checked_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_hash_cache_primary ON hash_cache(primary_hash);
"#;

/// Owned by `SqliteServerIndex`.
const SERVER_INDEX_V1: &str = r#"
CREATE TABLE IF NOT EXISTS server_assets_cache (
    remote_id TEXT PRIMARY KEY NOT NULL,
    checksum TEXT NOT NULL,
    original_filename TEXT NOT NULL,
    asset_type TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    cross_device_id TEXT,
    sync_type TEXT NOT NULL,
    synced_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_server_assets_checksum ON server_assets_cache(checksum);
CREATE INDEX IF NOT EXISTS idx_server_assets_cross_device ON server_assets_cache(cross_device_id);

CREATE TABLE IF NOT EXISTS sync_metadata (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_sync_time INTEGER NOT NULL,
    last_sync_type TEXT NOT NULL,
    user_id TEXT NOT NULL,
    total_assets INTEGER NOT NULL DEFAULT 0
);
"#;

/// Owned by `LocalUploadHost`.
const HOST_JOBS_V1: &str = r#"
CREATE TABLE IF NOT EXISTS host_jobs (
    id TEXT PRIMARY KEY NOT NULL,
    asset_id TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    remote_id TEXT,
    is_duplicate INTEGER NOT NULL DEFAULT 0,
    retryable INTEGER NOT NULL DEFAULT 1,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE (asset_id, resource_type)
);

CREATE INDEX IF NOT EXISTS idx_host_jobs_state ON host_jobs(state);
"#;

/// Get the current schema version from the database.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, StateError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StateError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

fn apply_v1(conn: &Connection) -> Result<(), StateError> {
    for ddl in [UPLOAD_HISTORY_V1, HASH_CACHE_V1, SERVER_INDEX_V1, HOST_JOBS_V1] {
        conn.execute_batch(ddl)?;
    }
    Ok(())
}

/// Initialize or migrate the database schema.
///
/// Idempotent: every store calls this when it opens its own connection.
pub(crate) fn migrate(conn: &Connection) -> Result<(), StateError> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StateError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    if current_version == 0 {
        apply_v1(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::debug!("Initialized database schema at version {}", SCHEMA_VERSION);
    } else {
        // Tables are CREATE IF NOT EXISTS, so re-applying is harmless and
        // repairs a database created by a build that lacked a table.
        apply_v1(conn)?;
    }

    Ok(())
}
