//! Local replica of the remote server's asset list.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use super::db::{self, from_millis, to_millis};
use super::error::StateError;
use super::types::{RemoteAssetType, ServerAssetRecord, SyncMetadata, SyncType};

/// Lookups answer "does the server hold this content?" without a round trip.
///
/// Lookups against an index that has never synced return `None`; callers
/// use [`ServerIndex::has_ever_synced`] to tell "absent" from "unknown".
#[async_trait]
pub trait ServerIndex: Send + Sync {
    /// Insert or replace records, stamping them with the sync that saw them.
    /// One transaction per call.
    async fn upsert(&self, records: &[ServerAssetRecord], sync: SyncType)
        -> Result<(), StateError>;

    /// Remove records by remote id. Returns rows removed.
    async fn delete(&self, remote_ids: &[String]) -> Result<u64, StateError>;

    /// Remove every record whose remote id is not in `keep`. Used after a
    /// full sync to drop assets the server no longer reports.
    async fn retain_only(&self, keep: &HashSet<String>) -> Result<u64, StateError>;

    async fn lookup_by_checksum(
        &self,
        checksum: &str,
    ) -> Result<Option<ServerAssetRecord>, StateError>;

    async fn lookup_by_cross_device_id(
        &self,
        cross_device_id: &str,
    ) -> Result<Option<ServerAssetRecord>, StateError>;

    /// Subset of `checksums` present in the index.
    async fn contains_checksums(&self, checksums: &[String])
        -> Result<HashSet<String>, StateError>;

    async fn has_ever_synced(&self) -> Result<bool, StateError>;

    async fn sync_metadata(&self) -> Result<Option<SyncMetadata>, StateError>;

    async fn save_sync_metadata(&self, metadata: &SyncMetadata) -> Result<(), StateError>;

    async fn count(&self) -> Result<u64, StateError>;

    /// Drop every record and the sync metadata so the next sync is full.
    async fn clear(&self) -> Result<(), StateError>;
}

pub struct SqliteServerIndex {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteServerIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteServerIndex")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteServerIndex {
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let conn = db::open_connection(path).await?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        Ok(Self {
            conn: Mutex::new(db::open_memory()?),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Every record ordered by remote id, for comparing index contents.
    #[cfg(test)]
    pub fn snapshot(&self) -> Result<Vec<ServerAssetRecord>, StateError> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM server_assets_cache ORDER BY remote_id"
            ))
            .map_err(StateError::query)?;
        let rows = stmt
            .query_map([], row_to_server_record)
            .map_err(StateError::query)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)
    }
}

const SELECT_COLUMNS: &str =
    "remote_id, checksum, original_filename, asset_type, updated_at, cross_device_id";

fn row_to_server_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServerAssetRecord> {
    let asset_type: String = row.get(3)?;
    Ok(ServerAssetRecord {
        remote_id: row.get(0)?,
        checksum: row.get(1)?,
        original_filename: row.get(2)?,
        asset_type: RemoteAssetType::parse(&asset_type),
        updated_at: from_millis(row.get(4)?),
        cross_device_id: row.get(5)?,
    })
}

#[async_trait]
impl ServerIndex for SqliteServerIndex {
    async fn upsert(
        &self,
        records: &[ServerAssetRecord],
        sync: SyncType,
    ) -> Result<(), StateError> {
        if records.is_empty() {
            return Ok(());
        }
        let synced_at = to_millis(&Utc::now());
        let conn = db::lock(&self.conn)?;
        db::in_transaction(&conn, |conn| {
            let mut stmt = conn
                .prepare_cached(
                    r#"INSERT INTO server_assets_cache
                        (remote_id, checksum, original_filename, asset_type, updated_at, cross_device_id, sync_type, synced_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                       ON CONFLICT(remote_id) DO UPDATE SET
                           checksum = excluded.checksum,
                           original_filename = excluded.original_filename,
                           asset_type = excluded.asset_type,
                           updated_at = excluded.updated_at,
                           cross_device_id = excluded.cross_device_id,
                           sync_type = excluded.sync_type,
                           synced_at = excluded.synced_at"#,
                )
                .map_err(StateError::query)?;
            for record in records {
                stmt.execute(rusqlite::params![
                    record.remote_id,
                    record.checksum,
                    record.original_filename,
                    record.asset_type.as_str(),
                    to_millis(&record.updated_at),
                    record.cross_device_id,
                    sync.as_str(),
                    synced_at,
                ])
                .map_err(StateError::query)?;
            }
            Ok(())
        })
    }

    async fn delete(&self, remote_ids: &[String]) -> Result<u64, StateError> {
        if remote_ids.is_empty() {
            return Ok(0);
        }
        let conn = db::lock(&self.conn)?;
        db::in_transaction(&conn, |conn| {
            let mut stmt = conn
                .prepare_cached("DELETE FROM server_assets_cache WHERE remote_id = ?1")
                .map_err(StateError::query)?;
            let mut removed = 0u64;
            for remote_id in remote_ids {
                removed += stmt.execute([remote_id]).map_err(StateError::query)? as u64;
            }
            Ok(removed)
        })
    }

    async fn retain_only(&self, keep: &HashSet<String>) -> Result<u64, StateError> {
        let conn = db::lock(&self.conn)?;
        let stale: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT remote_id FROM server_assets_cache")
                .map_err(StateError::query)?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(StateError::query)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StateError::query)?;
            ids.into_iter().filter(|id| !keep.contains(id)).collect()
        };
        if stale.is_empty() {
            return Ok(0);
        }
        db::in_transaction(&conn, |conn| {
            let mut stmt = conn
                .prepare_cached("DELETE FROM server_assets_cache WHERE remote_id = ?1")
                .map_err(StateError::query)?;
            let mut removed = 0u64;
            for remote_id in &stale {
                removed += stmt.execute([remote_id]).map_err(StateError::query)? as u64;
            }
            Ok(removed)
        })
    }

    async fn lookup_by_checksum(
        &self,
        checksum: &str,
    ) -> Result<Option<ServerAssetRecord>, StateError> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {SELECT_COLUMNS} FROM server_assets_cache WHERE checksum = ?1 LIMIT 1"
            ))
            .map_err(StateError::query)?;
        stmt.query_row([checksum], row_to_server_record)
            .optional()
            .map_err(StateError::query)
    }

    async fn lookup_by_cross_device_id(
        &self,
        cross_device_id: &str,
    ) -> Result<Option<ServerAssetRecord>, StateError> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {SELECT_COLUMNS} FROM server_assets_cache WHERE cross_device_id = ?1 LIMIT 1"
            ))
            .map_err(StateError::query)?;
        stmt.query_row([cross_device_id], row_to_server_record)
            .optional()
            .map_err(StateError::query)
    }

    async fn contains_checksums(
        &self,
        checksums: &[String],
    ) -> Result<HashSet<String>, StateError> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn
            .prepare_cached("SELECT 1 FROM server_assets_cache WHERE checksum = ?1 LIMIT 1")
            .map_err(StateError::query)?;
        let mut present = HashSet::new();
        for checksum in checksums {
            if stmt.exists([checksum]).map_err(StateError::query)? {
                present.insert(checksum.clone());
            }
        }
        Ok(present)
    }

    async fn has_ever_synced(&self) -> Result<bool, StateError> {
        let conn = db::lock(&self.conn)?;
        conn.prepare_cached("SELECT 1 FROM sync_metadata WHERE id = 1")
            .and_then(|mut stmt| stmt.exists([]))
            .map_err(StateError::query)
    }

    async fn sync_metadata(&self) -> Result<Option<SyncMetadata>, StateError> {
        let conn = db::lock(&self.conn)?;
        conn.query_row(
            "SELECT user_id, last_sync_time, total_assets, last_sync_type FROM sync_metadata WHERE id = 1",
            [],
            |row| {
                let sync_type: String = row.get(3)?;
                Ok(SyncMetadata {
                    user_id: row.get(0)?,
                    last_sync_time: from_millis(row.get(1)?),
                    total_assets: row.get::<_, i64>(2)?.max(0) as u64,
                    last_sync_type: SyncType::from_str(&sync_type).unwrap_or(SyncType::Full),
                })
            },
        )
        .optional()
        .map_err(StateError::query)
    }

    async fn save_sync_metadata(&self, metadata: &SyncMetadata) -> Result<(), StateError> {
        let conn = db::lock(&self.conn)?;
        conn.execute(
            r#"INSERT INTO sync_metadata (id, last_sync_time, last_sync_type, user_id, total_assets)
               VALUES (1, ?1, ?2, ?3, ?4)
               ON CONFLICT(id) DO UPDATE SET
                   last_sync_time = excluded.last_sync_time,
                   last_sync_type = excluded.last_sync_type,
                   user_id = excluded.user_id,
                   total_assets = excluded.total_assets"#,
            rusqlite::params![
                to_millis(&metadata.last_sync_time),
                metadata.last_sync_type.as_str(),
                metadata.user_id,
                metadata.total_assets as i64,
            ],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn count(&self) -> Result<u64, StateError> {
        let conn = db::lock(&self.conn)?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM server_assets_cache", [], |row| {
                row.get(0)
            })
            .map_err(StateError::query)?;
        Ok(count as u64)
    }

    async fn clear(&self) -> Result<(), StateError> {
        let conn = db::lock(&self.conn)?;
        db::in_transaction(&conn, |conn| {
            conn.execute("DELETE FROM server_assets_cache", [])
                .map_err(StateError::query)?;
            conn.execute("DELETE FROM sync_metadata", [])
                .map_err(StateError::query)?;
            Ok(())
        })
    }
}
