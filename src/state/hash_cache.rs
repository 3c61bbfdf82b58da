//! Persistent cache of content hashes and per-resource server confirmations.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use super::db::{self, from_millis, from_millis_opt, to_millis};
use super::error::StateError;
use super::types::{HashCacheRecord, HashCacheSummary, ResourceKind};

/// One server-confirmation result to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCheck {
    pub asset_id: String,
    pub kind: ResourceKind,
    pub on_server: bool,
}

#[async_trait]
pub trait HashCache: Send + Sync {
    async fn get(&self, asset_id: &str) -> Result<Option<HashCacheRecord>, StateError>;

    /// Records for every id in `asset_ids` that has one.
    async fn get_many(
        &self,
        asset_ids: &[String],
    ) -> Result<HashMap<String, HashCacheRecord>, StateError>;

    /// Persist a computed hash.
    ///
    /// Primary and video hashes create the row; a changed primary hash
    /// resets the primary confirmation. RAW hashes require the row to
    /// exist and fail with [`StateError::MissingHash`] otherwise.
    async fn store_hash(
        &self,
        asset_id: &str,
        kind: ResourceKind,
        hash: &str,
        has_raw: bool,
    ) -> Result<(), StateError>;

    /// Record whether the server holds a resource and stamp the check time.
    async fn record_server_check(
        &self,
        asset_id: &str,
        kind: ResourceKind,
        on_server: bool,
    ) -> Result<(), StateError>;

    /// Batch variant of [`HashCache::record_server_check`], in one transaction.
    async fn record_server_checks(&self, checks: &[ServerCheck]) -> Result<(), StateError>;

    /// Rows with at least one hashed resource not yet confirmed, oldest first.
    async fn unchecked(&self, limit: usize) -> Result<Vec<HashCacheRecord>, StateError>;

    /// Drop cached hashes so they are recomputed. Returns rows removed.
    async fn invalidate(&self, asset_ids: &[String]) -> Result<u64, StateError>;

    /// Delete rows whose asset no longer exists locally. Returns rows removed.
    async fn remove_orphans(&self, live_asset_ids: &HashSet<String>) -> Result<u64, StateError>;

    async fn summary(&self) -> Result<HashCacheSummary, StateError>;

    async fn clear(&self) -> Result<u64, StateError>;
}

pub struct SqliteHashCache {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteHashCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteHashCache")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteHashCache {
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
}

const SELECT_COLUMNS: &str = "asset_id, primary_hash, raw_hash, has_raw, primary_on_server, raw_on_server, calculated_at, checked_at, raw_checked_at";

fn row_to_hash_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<HashCacheRecord> {
    Ok(HashCacheRecord {
        asset_id: row.get(0)?,
        primary_hash: row.get(1)?,
        raw_hash: row.get(2)?,
        has_raw: row.get(3)?,
        primary_on_server: row.get(4)?,
        raw_on_server: row.get(5)?,
        calculated_at: from_millis(row.get(6)?),
        checked_at: from_millis_opt(row.get(7)?),
        raw_checked_at: from_millis_opt(row.get(8)?),
    })
}

fn apply_server_check(
    conn: &Connection,
    asset_id: &str,
    kind: ResourceKind,
    on_server: bool,
) -> Result<(), StateError> {
    let sql = if kind.is_raw() {
        "UPDATE hash_cache SET raw_on_server = ?2, raw_checked_at = ?3 WHERE asset_id = ?1"
    } else {
        "UPDATE hash_cache SET primary_on_server = ?2, checked_at = ?3 WHERE asset_id = ?1"
    };
    let changed = conn
        .prepare_cached(sql)
        .and_then(|mut stmt| {
            stmt.execute(rusqlite::params![asset_id, on_server, to_millis(&Utc::now())])
        })
        .map_err(StateError::query)?;
    if changed == 0 {
        return Err(StateError::MissingHash {
            asset_id: asset_id.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl HashCache for SqliteHashCache {
    async fn get(&self, asset_id: &str) -> Result<Option<HashCacheRecord>, StateError> {
        let conn = db::lock(&self.conn)?;
        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM hash_cache WHERE asset_id = ?1"),
            [asset_id],
            row_to_hash_record,
        )
        .optional()
        .map_err(StateError::query)
    }

    async fn get_many(
        &self,
        asset_ids: &[String],
    ) -> Result<HashMap<String, HashCacheRecord>, StateError> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {SELECT_COLUMNS} FROM hash_cache WHERE asset_id = ?1"
            ))
            .map_err(StateError::query)?;
        let mut found = HashMap::with_capacity(asset_ids.len());
        for asset_id in asset_ids {
            if let Some(record) = stmt
                .query_row([asset_id], row_to_hash_record)
                .optional()
                .map_err(StateError::query)?
            {
                found.insert(record.asset_id.clone(), record);
            }
        }
        Ok(found)
    }

    async fn store_hash(
        &self,
        asset_id: &str,
        kind: ResourceKind,
        hash: &str,
        has_raw: bool,
    ) -> Result<(), StateError> {
        let conn = db::lock(&self.conn)?;
        let now = to_millis(&Utc::now());

        if kind.is_raw() {
            let changed = conn
                .execute(
                    r#"UPDATE hash_cache SET
                        raw_checked_at = CASE WHEN raw_hash IS ?2 THEN raw_checked_at ELSE NULL END,
                        raw_on_server = CASE WHEN raw_hash IS ?2 THEN raw_on_server ELSE 0 END,
                        raw_hash = ?2,
                        has_raw = 1
                    WHERE asset_id = ?1"#,
                    rusqlite::params![asset_id, hash],
                )
                .map_err(StateError::query)?;
            if changed == 0 {
                return Err(StateError::MissingHash {
                    asset_id: asset_id.to_string(),
                });
            }
            return Ok(());
        }

        conn.execute(
            r#"INSERT INTO hash_cache (asset_id, primary_hash, has_raw, calculated_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(asset_id) DO UPDATE SET
                   checked_at = CASE WHEN primary_hash = excluded.primary_hash THEN checked_at ELSE NULL END,
                   primary_on_server = CASE WHEN primary_hash = excluded.primary_hash THEN primary_on_server ELSE 0 END,
                   primary_hash = excluded.primary_hash,
                   has_raw = excluded.has_raw,
                   calculated_at = excluded.calculated_at"#,
            rusqlite::params![asset_id, hash, has_raw, now],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn record_server_check(
        &self,
        asset_id: &str,
        kind: ResourceKind,
        on_server: bool,
    ) -> Result<(), StateError> {
        let conn = db::lock(&self.conn)?;
        apply_server_check(&conn, asset_id, kind, on_server)
    }

    async fn record_server_checks(&self, checks: &[ServerCheck]) -> Result<(), StateError> {
        if checks.is_empty() {
            return Ok(());
        }
        let conn = db::lock(&self.conn)?;
        db::in_transaction(&conn, |conn| {
            for check in checks {
                apply_server_check(conn, &check.asset_id, check.kind, check.on_server)?;
            }
            Ok(())
        })
    }

    async fn unchecked(&self, limit: usize) -> Result<Vec<HashCacheRecord>, StateError> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn
            .prepare_cached(&format!(
                r#"SELECT {SELECT_COLUMNS} FROM hash_cache
                   WHERE checked_at IS NULL
                      OR (has_raw = 1 AND raw_hash IS NOT NULL AND raw_checked_at IS NULL)
                   ORDER BY calculated_at
                   LIMIT ?1"#
            ))
            .map_err(StateError::query)?;
        let rows = stmt
            .query_map([limit as i64], row_to_hash_record)
            .map_err(StateError::query)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)
    }

    async fn invalidate(&self, asset_ids: &[String]) -> Result<u64, StateError> {
        if asset_ids.is_empty() {
            return Ok(0);
        }
        let conn = db::lock(&self.conn)?;
        db::in_transaction(&conn, |conn| {
            let mut stmt = conn
                .prepare_cached("DELETE FROM hash_cache WHERE asset_id = ?1")
                .map_err(StateError::query)?;
            let mut removed = 0u64;
            for asset_id in asset_ids {
                removed += stmt.execute([asset_id]).map_err(StateError::query)? as u64;
            }
            Ok(removed)
        })
    }

    async fn remove_orphans(&self, live_asset_ids: &HashSet<String>) -> Result<u64, StateError> {
        let orphans: Vec<String> = {
            let conn = db::lock(&self.conn)?;
            let mut stmt = conn
                .prepare("SELECT asset_id FROM hash_cache")
                .map_err(StateError::query)?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(StateError::query)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StateError::query)?;
            ids.into_iter()
                .filter(|id| !live_asset_ids.contains(id))
                .collect()
        };
        let removed = self.invalidate(&orphans).await?;
        if removed > 0 {
            tracing::info!(removed, "Removed cached hashes for assets no longer in the library");
        }
        Ok(removed)
    }

    async fn summary(&self) -> Result<HashCacheSummary, StateError> {
        let conn = db::lock(&self.conn)?;
        conn.query_row(
            r#"SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN checked_at IS NULL
                    OR (has_raw = 1 AND raw_hash IS NOT NULL AND raw_checked_at IS NULL)
                    THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN primary_on_server = 1 THEN 1 ELSE 0 END), 0)
               FROM hash_cache"#,
            [],
            |row| {
                Ok(HashCacheSummary {
                    hashed: row.get::<_, i64>(0)? as u64,
                    unchecked: row.get::<_, i64>(1)? as u64,
                    on_server: row.get::<_, i64>(2)? as u64,
                })
            },
        )
        .map_err(StateError::query)
    }

    async fn clear(&self) -> Result<u64, StateError> {
        let conn = db::lock(&self.conn)?;
        let removed = conn
            .execute("DELETE FROM hash_cache", [])
            .map_err(StateError::query)?;
        Ok(removed as u64)
    }
}
