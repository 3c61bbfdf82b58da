//! Durable record of resources this device has uploaded.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;

use super::db::{self, to_millis};
use super::error::StateError;
use super::types::{ResourceKind, UploadRecord};

/// Store of "uploaded by this device" facts.
///
/// This is the one local source of truth that survives a rebuild of the
/// server index, so records are only removed by `clear` or `remove_orphans`.
#[async_trait]
pub trait UploadHistory: Send + Sync {
    /// Insert or update the record for `(asset_id, resource_kind)`.
    ///
    /// Idempotent: repeating the call leaves exactly one row and keeps the
    /// original `uploaded_at`.
    async fn upsert(&self, record: &UploadRecord) -> Result<(), StateError>;

    /// All `(asset_id, kind)` pairs with a record.
    async fn uploaded_keys(&self) -> Result<HashSet<(String, ResourceKind)>, StateError>;

    /// `(asset_id, kind)` pairs with a record, restricted to `asset_ids`.
    async fn uploaded_for(
        &self,
        asset_ids: &[String],
    ) -> Result<HashSet<(String, ResourceKind)>, StateError>;

    async fn count(&self) -> Result<u64, StateError>;

    /// Delete records whose asset no longer exists locally. Returns rows removed.
    async fn remove_orphans(&self, live_asset_ids: &HashSet<String>) -> Result<u64, StateError>;

    /// Delete every record. Returns rows removed.
    async fn clear(&self) -> Result<u64, StateError>;
}

pub struct SqliteUploadHistory {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteUploadHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteUploadHistory")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteUploadHistory {
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

    #[cfg(test)]
    pub async fn get(
        &self,
        asset_id: &str,
        kind: ResourceKind,
    ) -> Result<Option<UploadRecord>, StateError> {
        use rusqlite::OptionalExtension;
        let conn = db::lock(&self.conn)?;
        conn.query_row(
            "SELECT asset_id, resource_type, filename, remote_id, uploaded_at, file_size, is_duplicate, is_favorite FROM uploaded_assets WHERE asset_id = ?1 AND resource_type = ?2",
            [asset_id, kind.as_str()],
            row_to_upload_record,
        )
        .optional()
        .map_err(StateError::query)
    }
}

const UPSERT_SQL: &str = r#"
    INSERT INTO uploaded_assets (asset_id, resource_type, filename, remote_id, uploaded_at, file_size, is_duplicate, is_favorite)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(asset_id, resource_type) DO UPDATE SET
        filename = excluded.filename,
        remote_id = excluded.remote_id,
        file_size = excluded.file_size,
        is_duplicate = excluded.is_duplicate,
        is_favorite = excluded.is_favorite
"#;

fn execute_upsert(conn: &Connection, record: &UploadRecord) -> Result<(), StateError> {
    let mut stmt = conn.prepare_cached(UPSERT_SQL).map_err(StateError::query)?;
    stmt.execute(rusqlite::params![
        record.asset_id,
        record.resource_kind.as_str(),
        record.filename,
        record.remote_id,
        to_millis(&record.uploaded_at),
        record.file_size as i64,
        record.is_duplicate,
        record.is_favorite,
    ])
    .map_err(StateError::query)?;
    Ok(())
}

#[cfg(test)]
fn row_to_upload_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<UploadRecord> {
    let kind: String = row.get(1)?;
    let file_size: i64 = row.get(5)?;
    Ok(UploadRecord {
        asset_id: row.get(0)?,
        resource_kind: ResourceKind::from_str(&kind).unwrap_or(ResourceKind::Primary),
        filename: row.get(2)?,
        remote_id: row.get(3)?,
        uploaded_at: db::from_millis(row.get(4)?),
        file_size: file_size.max(0) as u64,
        is_duplicate: row.get(6)?,
        is_favorite: row.get(7)?,
    })
}

fn keys_from_rows(
    rows: impl Iterator<Item = rusqlite::Result<(String, String)>>,
) -> Result<HashSet<(String, ResourceKind)>, StateError> {
    let mut keys = HashSet::new();
    for row in rows {
        let (asset_id, kind) = row.map_err(StateError::query)?;
        if let Some(kind) = ResourceKind::from_str(&kind) {
            keys.insert((asset_id, kind));
        }
    }
    Ok(keys)
}

#[async_trait]
impl UploadHistory for SqliteUploadHistory {
    async fn upsert(&self, record: &UploadRecord) -> Result<(), StateError> {
        let conn = db::lock(&self.conn)?;
        execute_upsert(&conn, record)
    }

    async fn uploaded_keys(&self) -> Result<HashSet<(String, ResourceKind)>, StateError> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn
            .prepare_cached("SELECT asset_id, resource_type FROM uploaded_assets")
            .map_err(StateError::query)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(StateError::query)?;
        keys_from_rows(rows)
    }

    async fn uploaded_for(
        &self,
        asset_ids: &[String],
    ) -> Result<HashSet<(String, ResourceKind)>, StateError> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn
            .prepare_cached("SELECT asset_id, resource_type FROM uploaded_assets WHERE asset_id = ?1")
            .map_err(StateError::query)?;
        let mut keys = HashSet::new();
        for asset_id in asset_ids {
            let rows = stmt
                .query_map([asset_id], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(StateError::query)?;
            keys.extend(keys_from_rows(rows)?);
        }
        Ok(keys)
    }

    async fn count(&self) -> Result<u64, StateError> {
        let conn = db::lock(&self.conn)?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM uploaded_assets", [], |row| row.get(0))
            .map_err(StateError::query)?;
        Ok(count as u64)
    }

    async fn remove_orphans(&self, live_asset_ids: &HashSet<String>) -> Result<u64, StateError> {
        let conn = db::lock(&self.conn)?;
        let known: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT DISTINCT asset_id FROM uploaded_assets")
                .map_err(StateError::query)?;
            let ids = stmt
                .query_map([], |row| row.get(0))
                .map_err(StateError::query)?
                .collect::<Result<Vec<String>, _>>()
                .map_err(StateError::query)?;
            ids
        };
        let orphans: Vec<&String> = known
            .iter()
            .filter(|id| !live_asset_ids.contains(*id))
            .collect();
        if orphans.is_empty() {
            return Ok(0);
        }

        let removed = db::in_transaction(&conn, |conn| {
            let mut stmt = conn
                .prepare_cached("DELETE FROM uploaded_assets WHERE asset_id = ?1")
                .map_err(StateError::query)?;
            let mut removed = 0u64;
            for asset_id in &orphans {
                removed += stmt.execute([asset_id]).map_err(StateError::query)? as u64;
            }
            Ok(removed)
        })?;
        tracing::info!(removed, "Removed upload records for assets no longer in the library");
        Ok(removed)
    }

    async fn clear(&self) -> Result<u64, StateError> {
        let conn = db::lock(&self.conn)?;
        let removed = conn
            .execute("DELETE FROM uploaded_assets", [])
            .map_err(StateError::query)?;
        Ok(removed as u64)
    }
}

/// Build a record for a freshly uploaded resource.
pub fn new_upload_record(
    asset_id: &str,
    kind: ResourceKind,
    filename: &str,
    remote_id: &str,
    file_size: u64,
    is_duplicate: bool,
    is_favorite: bool,
) -> UploadRecord {
    UploadRecord {
        asset_id: asset_id.to_string(),
        filename: filename.to_string(),
        remote_id: remote_id.to_string(),
        uploaded_at: Utc::now(),
        file_size,
        resource_kind: kind,
        is_duplicate,
        is_favorite,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(asset_id: &str, kind: ResourceKind, remote_id: &str) -> UploadRecord {
        new_upload_record(asset_id, kind, "IMG_0001.HEIC", remote_id, 2048, false, false)
    }

    async fn upsert_all(history: &SqliteUploadHistory, records: &[UploadRecord]) {
        for record in records {
            history.upsert(record).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let history = SqliteUploadHistory::open_in_memory().unwrap();
        history
            .upsert(&record("A1", ResourceKind::Primary, "r-1"))
            .await
            .unwrap();

        let got = history.get("A1", ResourceKind::Primary).await.unwrap().unwrap();
        assert_eq!(got.remote_id, "r-1");
        assert_eq!(got.file_size, 2048);
        assert!(history.get("A1", ResourceKind::Raw).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_keeps_first_upload_time() {
        let history = SqliteUploadHistory::open_in_memory().unwrap();
        let first = record("A1", ResourceKind::Primary, "r-1");
        history.upsert(&first).await.unwrap();

        let mut again = record("A1", ResourceKind::Primary, "r-1");
        again.uploaded_at = first.uploaded_at + chrono::Duration::hours(1);
        again.is_duplicate = true;
        history.upsert(&again).await.unwrap();

        assert_eq!(history.count().await.unwrap(), 1);
        let got = history.get("A1", ResourceKind::Primary).await.unwrap().unwrap();
        assert_eq!(
            got.uploaded_at.timestamp_millis(),
            first.uploaded_at.timestamp_millis()
        );
        assert!(got.is_duplicate);
    }

    #[tokio::test]
    async fn test_primary_and_raw_are_separate_rows() {
        let history = SqliteUploadHistory::open_in_memory().unwrap();
        upsert_all(
            &history,
            &[
                record("A1", ResourceKind::Primary, "r-1"),
                record("A1", ResourceKind::Raw, "r-2"),
                record("V1", ResourceKind::Video, "r-3"),
            ],
        )
        .await;

        let keys = history.uploaded_keys().await.unwrap();
        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&("A1".to_string(), ResourceKind::Raw)));

        let scoped = history.uploaded_for(&["A1".to_string()]).await.unwrap();
        assert_eq!(scoped.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_orphans() {
        let history = SqliteUploadHistory::open_in_memory().unwrap();
        upsert_all(
            &history,
            &[
                record("KEEP", ResourceKind::Primary, "r-1"),
                record("GONE", ResourceKind::Primary, "r-2"),
                record("GONE", ResourceKind::Raw, "r-3"),
            ],
        )
        .await;

        let live: HashSet<String> = ["KEEP".to_string()].into_iter().collect();
        assert_eq!(history.remove_orphans(&live).await.unwrap(), 2);
        assert_eq!(history.count().await.unwrap(), 1);
        assert_eq!(history.remove_orphans(&live).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let history = SqliteUploadHistory::open_in_memory().unwrap();
        history
            .upsert(&record("A1", ResourceKind::Primary, "r-1"))
            .await
            .unwrap();
        assert_eq!(history.clear().await.unwrap(), 1);
        assert_eq!(history.count().await.unwrap(), 0);
    }
}
