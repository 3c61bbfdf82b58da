use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tokio_util::sync::CancellationToken;

use super::status::{derive_status, StatusInputs, SyncStatus};
use crate::hashing::HashStore;
use crate::library::{LocalAsset, PhotoInventory};
use crate::state::{ResourceKind, ServerCheck, ServerIndex, UploadHistory};

pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Most unchecked hash rows pulled into one post-sync re-check.
const RECHECK_SCAN_LIMIT: usize = 5_000;

/// Counts of assets per status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCounts(pub HashMap<SyncStatus, usize>);

impl StatusCounts {
    pub fn get(&self, status: SyncStatus) -> usize {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }
}

impl std::fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = SyncStatus::ALL
            .iter()
            .map(|s| format!("{}={}", s, self.get(*s)))
            .collect();
        f.write_str(&parts.join(" "))
    }
}

/// What one background processing run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingReport {
    /// Resources hashed.
    pub hashed: usize,
    /// Resources whose server confirmation was recorded.
    pub checked: usize,
    /// Assets that failed hashing or checking.
    pub failed: usize,
    pub cancelled: bool,
}

/// Classifies library assets by combining upload history, cached hashes and
/// the server index, and keeps a status cache for the whole library.
///
/// The cache is updated incrementally for the assets a batch, sync or upload
/// touched. Work remaining is always re-derived from store contents, so a
/// cancelled run resumes by running again.
pub struct DedupResolver {
    hashes: Arc<HashStore>,
    index: Arc<dyn ServerIndex>,
    history: Arc<dyn UploadHistory>,
    inventory: Arc<dyn PhotoInventory>,
    statuses: RwLock<HashMap<String, SyncStatus>>,
    in_flight: Mutex<HashSet<String>>,
    failed: Mutex<HashSet<String>>,
    batch_size: usize,
}

impl DedupResolver {
    pub fn new(
        hashes: Arc<HashStore>,
        index: Arc<dyn ServerIndex>,
        history: Arc<dyn UploadHistory>,
        inventory: Arc<dyn PhotoInventory>,
        batch_size: usize,
    ) -> Self {
        Self {
            hashes,
            index,
            history,
            inventory,
            statuses: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            failed: Mutex::new(HashSet::new()),
            batch_size: batch_size.max(1),
        }
    }

    /// Cached status; assets not yet classified are `Pending`.
    pub fn status(&self, asset_id: &str) -> SyncStatus {
        self.statuses
            .read()
            .ok()
            .and_then(|map| map.get(asset_id).copied())
            .unwrap_or(SyncStatus::Pending)
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = HashMap::new();
        if let Ok(map) = self.statuses.read() {
            for status in map.values() {
                *counts.entry(*status).or_insert(0) += 1;
            }
        }
        StatusCounts(counts)
    }

    fn set_status(&self, asset_id: &str, status: SyncStatus) {
        if let Ok(mut map) = self.statuses.write() {
            map.insert(asset_id.to_string(), status);
        }
    }

    fn is_failed(&self, asset_id: &str) -> bool {
        self.failed
            .lock()
            .map(|set| set.contains(asset_id))
            .unwrap_or(false)
    }

    fn mark_failed(&self, asset_id: &str, failed: bool) {
        if let Ok(mut set) = self.failed.lock() {
            if failed {
                set.insert(asset_id.to_string());
            } else {
                set.remove(asset_id);
            }
        }
    }

    fn mark_in_flight(&self, asset_id: &str, in_flight: bool) {
        if let Ok(mut set) = self.in_flight.lock() {
            if in_flight {
                set.insert(asset_id.to_string());
            } else {
                set.remove(asset_id);
            }
        }
        if in_flight {
            self.set_status(asset_id, SyncStatus::Processing);
        }
    }

    /// Recompute the status of every library asset.
    pub async fn refresh_all(&self) {
        match self.inventory.all_asset_ids().await {
            Ok(ids) => {
                if let Ok(mut map) = self.statuses.write() {
                    let live: HashSet<&String> = ids.iter().collect();
                    map.retain(|id, _| live.contains(id));
                }
                self.refresh(&ids).await;
            }
            Err(e) => tracing::warn!(error = %e, "Could not list library assets"),
        }
    }

    /// Recompute statuses for `asset_ids`.
    ///
    /// Store failures are logged and leave the previous statuses in place.
    pub async fn refresh(&self, asset_ids: &[String]) {
        for chunk in asset_ids.chunks(self.batch_size) {
            if let Err(e) = self.refresh_chunk(chunk).await {
                tracing::warn!(error = %e, count = chunk.len(), "Status refresh failed, keeping previous state");
            }
        }
    }

    async fn refresh_chunk(&self, ids: &[String]) -> anyhow::Result<()> {
        let records = self.hashes.cached_many(ids).await?;
        let uploaded = self.history.uploaded_for(ids).await?;
        let in_flight = self.in_flight.lock().map(|s| s.clone()).unwrap_or_default();

        let mut updates = Vec::with_capacity(ids.len());
        let mut gone = Vec::new();
        for id in ids {
            let Some(asset) = self.inventory.asset(id).await? else {
                gone.push(id);
                continue;
            };
            let inputs = StatusInputs {
                has_raw: asset.has_raw(),
                hash: records.get(id),
                primary_uploaded: uploaded.contains(&(id.clone(), asset.primary_kind())),
                raw_uploaded: uploaded.contains(&(id.clone(), ResourceKind::Raw)),
                in_flight: in_flight.contains(id),
                failed: self.is_failed(id),
            };
            updates.push((id.clone(), derive_status(&inputs)));
        }

        if let Ok(mut map) = self.statuses.write() {
            for id in gone {
                map.remove(id);
            }
            map.extend(updates);
        }
        Ok(())
    }

    /// Hash then check `asset_ids` in bounded batches.
    ///
    /// Hashing runs before checking since a check needs a hash. Cancellation
    /// is observed between assets; already persisted work is kept.
    pub async fn start_background_processing(
        &self,
        asset_ids: &[String],
        cancel: &CancellationToken,
    ) -> ProcessingReport {
        let mut report = ProcessingReport::default();

        for chunk in asset_ids.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return report;
            }
            self.hash_batch(chunk, cancel, &mut report).await;
            self.refresh(chunk).await;
        }

        let synced = match self.index.has_ever_synced().await {
            Ok(synced) => synced,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read sync state, skipping checks");
                return report;
            }
        };
        if !synced {
            tracing::debug!("Server index has never synced; unresolved checks stay pending");
        }

        for chunk in asset_ids.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return report;
            }
            self.check_batch(chunk, synced, cancel, &mut report).await;
            self.refresh(chunk).await;
        }

        tracing::info!(
            hashed = report.hashed,
            checked = report.checked,
            failed = report.failed,
            cancelled = report.cancelled,
            "Background processing finished"
        );
        report
    }

    async fn hash_batch(
        &self,
        ids: &[String],
        cancel: &CancellationToken,
        report: &mut ProcessingReport,
    ) {
        let records = match self.hashes.cached_many(ids).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read hash cache");
                return;
            }
        };

        for id in ids {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return;
            }
            let asset = match self.inventory.asset(id).await {
                Ok(Some(asset)) => asset,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(asset_id = %id, error = %e, "Could not load asset");
                    continue;
                }
            };

            let record = records.get(id);
            let mut needed = Vec::new();
            if record.is_none() {
                needed.push(asset.primary_kind());
            }
            if asset.has_raw() && record.and_then(|r| r.raw_hash.as_ref()).is_none() {
                needed.push(ResourceKind::Raw);
            }
            if needed.is_empty() {
                continue;
            }

            self.mark_in_flight(id, true);
            let mut failed = false;
            for kind in needed {
                match self.hashes.hash_of(id, kind).await {
                    Ok(_) => report.hashed += 1,
                    Err(e) => {
                        tracing::warn!(asset_id = %id, kind = %kind, error = %e, "Hashing failed");
                        failed = true;
                        break;
                    }
                }
            }
            self.mark_in_flight(id, false);
            self.mark_failed(id, failed);
            if failed {
                report.failed += 1;
            }
        }
    }

    async fn check_batch(
        &self,
        ids: &[String],
        synced: bool,
        cancel: &CancellationToken,
        report: &mut ProcessingReport,
    ) {
        let records = match self.hashes.cached_many(ids).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read hash cache");
                return;
            }
        };

        let mut checks = Vec::new();
        for id in ids {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let Some(record) = records.get(id) else {
                continue;
            };
            let asset = match self.inventory.asset(id).await {
                Ok(Some(asset)) => asset,
                _ => continue,
            };

            let mut pending = Vec::new();
            if record.checked_at.is_none() {
                pending.push((asset.primary_kind(), record.primary_hash.clone()));
            }
            if let (Some(raw), None) = (record.raw_hash.as_ref(), record.raw_checked_at) {
                pending.push((ResourceKind::Raw, raw.clone()));
            }

            for (kind, hash) in pending {
                match self.find_on_server(&asset, kind, &hash).await {
                    // Without a completed sync, absence proves nothing.
                    Ok(false) if !synced => {}
                    Ok(on_server) => checks.push(ServerCheck {
                        asset_id: id.clone(),
                        kind,
                        on_server,
                    }),
                    Err(e) => {
                        tracing::warn!(asset_id = %id, kind = %kind, error = %e, "Server check failed");
                        self.mark_failed(id, true);
                        report.failed += 1;
                        break;
                    }
                }
            }
        }

        if checks.is_empty() {
            return;
        }
        match self.hashes.record_server_checks(&checks).await {
            Ok(()) => report.checked += checks.len(),
            Err(e) => tracing::warn!(error = %e, "Could not record server checks"),
        }
    }

    /// Look a resource up in the server index by checksum, and for the
    /// primary resource also by cross-device id.
    async fn find_on_server(
        &self,
        asset: &LocalAsset,
        kind: ResourceKind,
        hash: &str,
    ) -> Result<bool, crate::state::StateError> {
        if self.index.lookup_by_checksum(hash).await?.is_some() {
            return Ok(true);
        }
        if kind.is_raw() {
            return Ok(false);
        }
        match asset.cross_device_id.as_deref() {
            Some(cross_device_id) => Ok(self
                .index
                .lookup_by_cross_device_id(cross_device_id)
                .await?
                .is_some()),
            None => Ok(false),
        }
    }

    /// Re-run checks after the server index changed.
    ///
    /// Assets previously confirmed absent are looked up again, since another
    /// device may have uploaded them since. Resources hashed while the index
    /// had never synced get their first answer here.
    pub async fn refresh_after_sync(&self, cancel: &CancellationToken) -> ProcessingReport {
        let mut report = ProcessingReport::default();
        let synced = match self.index.has_ever_synced().await {
            Ok(synced) => synced,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read sync state, skipping re-check");
                return report;
            }
        };
        // Unchecked rows come from the store so assets this process never
        // classified are covered too.
        let mut candidates: Vec<String> = match self.hashes.unchecked(RECHECK_SCAN_LIMIT).await {
            Ok(records) => records.into_iter().map(|r| r.asset_id).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not list unchecked hashes");
                Vec::new()
            }
        };
        let mut seen: HashSet<String> = candidates.iter().cloned().collect();
        if let Ok(map) = self.statuses.read() {
            for (id, status) in map.iter() {
                if matches!(status, SyncStatus::Checking | SyncStatus::NotUploaded)
                    && seen.insert(id.clone())
                {
                    candidates.push(id.clone());
                }
            }
        }
        for chunk in candidates.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            self.recheck_batch(chunk, synced, &mut report).await;
            self.refresh(chunk).await;
        }
        report
    }

    async fn recheck_batch(&self, ids: &[String], synced: bool, report: &mut ProcessingReport) {
        let records = match self.hashes.cached_many(ids).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read hash cache");
                return;
            }
        };
        let mut checks = Vec::new();
        for id in ids {
            let (Some(record), Ok(Some(asset))) = (records.get(id), self.inventory.asset(id).await)
            else {
                continue;
            };
            let mut resources = vec![(asset.primary_kind(), Some(record.primary_hash.as_str()))];
            if asset.has_raw() {
                resources.push((ResourceKind::Raw, record.raw_hash.as_deref()));
            }
            for (kind, hash) in resources {
                let Some(hash) = hash else { continue };
                if record.on_server(kind) {
                    continue;
                }
                match self.find_on_server(&asset, kind, hash).await {
                    Ok(true) => checks.push(ServerCheck {
                        asset_id: id.clone(),
                        kind,
                        on_server: true,
                    }),
                    // First answer for a resource left unresolved before any sync.
                    Ok(false) if synced && !record.is_checked(kind) => checks.push(ServerCheck {
                        asset_id: id.clone(),
                        kind,
                        on_server: false,
                    }),
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(asset_id = %id, kind = %kind, error = %e, "Server re-check failed");
                    }
                }
            }
        }
        if checks.is_empty() {
            return;
        }
        match self.hashes.record_server_checks(&checks).await {
            Ok(()) => report.checked += checks.len(),
            Err(e) => tracing::warn!(error = %e, "Could not record server checks"),
        }
    }

    /// Update the cache after an upload of `asset_id` completed.
    pub async fn on_upload_completed(&self, asset_id: &str) {
        self.mark_failed(asset_id, false);
        self.refresh(&[asset_id.to_string()]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::state::{
        new_upload_record, RemoteAssetType, ServerAssetRecord, SqliteHashCache,
        SqliteServerIndex, SqliteUploadHistory, SyncMetadata, SyncType,
    };
    use crate::testutil::{sha256_hex, MemoryLibrary};

    struct Fixture {
        library: Arc<MemoryLibrary>,
        index: Arc<SqliteServerIndex>,
        history: Arc<SqliteUploadHistory>,
        hashes: Arc<HashStore>,
        resolver: DedupResolver,
    }

    fn fixture() -> Fixture {
        let library = Arc::new(MemoryLibrary::new());
        let index = Arc::new(SqliteServerIndex::open_in_memory().unwrap());
        let history = Arc::new(SqliteUploadHistory::open_in_memory().unwrap());
        let hashes = Arc::new(HashStore::new(
            Arc::new(SqliteHashCache::open_in_memory().unwrap()),
            library.clone(),
            1024,
        ));
        let resolver = DedupResolver::new(
            hashes.clone(),
            index.clone(),
            history.clone(),
            library.clone(),
            2,
        );
        Fixture {
            library,
            index,
            history,
            hashes,
            resolver,
        }
    }

    async fn mark_synced(index: &SqliteServerIndex, checksums: &[&str]) {
        let records: Vec<ServerAssetRecord> = checksums
            .iter()
            .enumerate()
            .map(|(i, checksum)| ServerAssetRecord {
                remote_id: format!("remote-{i}"),
                checksum: checksum.to_string(),
                original_filename: format!("remote-{i}.jpg"),
                updated_at: Utc::now(),
                cross_device_id: None,
                asset_type: RemoteAssetType::Image,
            })
            .collect();
        index.upsert(&records, SyncType::Full).await.unwrap();
        index
            .save_sync_metadata(&SyncMetadata {
                user_id: "user-1".into(),
                last_sync_time: Utc::now(),
                total_assets: records.len() as u64,
                last_sync_type: SyncType::Full,
            })
            .await
            .unwrap();
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_unhashed_asset_is_pending() {
        let f = fixture();
        f.library.add_image("A1", b"jpeg", None);
        f.resolver.refresh_all().await;
        assert_eq!(f.resolver.status("A1"), SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_never_synced_index_leaves_asset_checking() {
        let f = fixture();
        f.library.add_image("A1", b"jpeg", None);

        let report = f
            .resolver
            .start_background_processing(&ids(&["A1"]), &CancellationToken::new())
            .await;
        assert_eq!(report.hashed, 1);
        assert_eq!(report.checked, 0);
        assert_eq!(f.resolver.status("A1"), SyncStatus::Checking);
        assert!(f.hashes.cached("A1").await.unwrap().unwrap().checked_at.is_none());
    }

    #[tokio::test]
    async fn test_first_sync_resolves_assets_hashed_before_it() {
        let f = fixture();
        f.library.add_image("A1", b"absent", None);
        f.library.add_image("A2", b"present", Some(b"present-raw"));
        let cancel = CancellationToken::new();

        f.resolver
            .start_background_processing(&ids(&["A1", "A2"]), &cancel)
            .await;
        assert_eq!(f.resolver.status("A1"), SyncStatus::Checking);
        assert_eq!(f.resolver.status("A2"), SyncStatus::Checking);

        mark_synced(&f.index, &[&sha256_hex(b"present"), "unrelated"]).await;
        f.resolver.refresh_all().await;
        let report = f.resolver.refresh_after_sync(&cancel).await;

        assert_eq!(report.checked, 3);
        assert_eq!(f.resolver.status("A1"), SyncStatus::NotUploaded);
        // Primary found, RAW confirmed absent.
        assert_eq!(f.resolver.status("A2"), SyncStatus::NotUploaded);
        let a1 = f.hashes.cached("A1").await.unwrap().unwrap();
        assert!(a1.checked_at.is_some());
        assert!(!a1.primary_on_server);
        let a2 = f.hashes.cached("A2").await.unwrap().unwrap();
        assert!(a2.primary_on_server);
        assert!(a2.raw_checked_at.is_some());
        assert!(!a2.raw_on_server);
    }

    #[tokio::test]
    async fn test_recheck_after_sync_covers_assets_this_process_never_classified() {
        let f = fixture();
        f.library.add_image("A1", b"absent", None);
        f.resolver
            .start_background_processing(&ids(&["A1"]), &CancellationToken::new())
            .await;
        mark_synced(&f.index, &["unrelated"]).await;

        // A later invocation starts with an empty status cache.
        let fresh = DedupResolver::new(
            f.hashes.clone(),
            f.index.clone(),
            f.history.clone(),
            f.library.clone(),
            DEFAULT_BATCH_SIZE,
        );
        let report = fresh.refresh_after_sync(&CancellationToken::new()).await;

        assert_eq!(report.checked, 1);
        assert_eq!(fresh.status("A1"), SyncStatus::NotUploaded);
        assert!(f.hashes.unchecked(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_without_any_sync_records_nothing() {
        let f = fixture();
        f.library.add_image("A1", b"jpeg", None);
        let cancel = CancellationToken::new();
        f.resolver
            .start_background_processing(&ids(&["A1"]), &cancel)
            .await;

        let report = f.resolver.refresh_after_sync(&cancel).await;
        assert_eq!(report.checked, 0);
        assert_eq!(f.resolver.status("A1"), SyncStatus::Checking);
    }

    #[tokio::test]
    async fn test_checksum_in_index_marks_uploaded_without_local_record() {
        let f = fixture();
        f.library.add_image("A1", b"abc123-content", None);
        mark_synced(&f.index, &[&sha256_hex(b"abc123-content")]).await;

        f.resolver
            .start_background_processing(&ids(&["A1"]), &CancellationToken::new())
            .await;

        let record = f.hashes.cached("A1").await.unwrap().unwrap();
        assert!(record.primary_on_server);
        assert_eq!(f.resolver.status("A1"), SyncStatus::Uploaded);
        assert_eq!(f.history.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_absent_from_synced_index_is_not_uploaded() {
        let f = fixture();
        f.library.add_image("A1", b"new content", None);
        mark_synced(&f.index, &["something-else"]).await;

        f.resolver
            .start_background_processing(&ids(&["A1"]), &CancellationToken::new())
            .await;
        assert_eq!(f.resolver.status("A1"), SyncStatus::NotUploaded);
    }

    #[tokio::test]
    async fn test_local_upload_record_marks_uploaded() {
        let f = fixture();
        f.library.add_image("A1", b"jpeg", None);
        f.history
            .upsert(&new_upload_record(
                "A1",
                ResourceKind::Primary,
                "A1.jpg",
                "r-1",
                4,
                false,
                false,
            ))
            .await
            .unwrap();
        f.resolver.refresh_all().await;
        assert_eq!(f.resolver.status("A1"), SyncStatus::Uploaded);
    }

    #[tokio::test]
    async fn test_raw_asset_needs_raw_confirmed_too() {
        let f = fixture();
        f.library.add_image("A1", b"jpeg", Some(b"dng"));
        mark_synced(&f.index, &["unrelated"]).await;
        f.history
            .upsert(&new_upload_record(
                "A1",
                ResourceKind::Primary,
                "A1.jpg",
                "r-1",
                4,
                false,
                false,
            ))
            .await
            .unwrap();

        f.resolver
            .start_background_processing(&ids(&["A1"]), &CancellationToken::new())
            .await;
        assert_eq!(f.resolver.status("A1"), SyncStatus::NotUploaded);

        // RAW shows up on the server via another device.
        mark_synced(&f.index, &[&sha256_hex(b"dng")]).await;
        f.resolver.refresh_after_sync(&CancellationToken::new()).await;
        assert_eq!(f.resolver.status("A1"), SyncStatus::Uploaded);
    }

    #[tokio::test]
    async fn test_cross_device_id_match_confirms_primary() {
        let f = fixture();
        f.library.add_image("A1", b"re-encoded", None);
        f.library.set_cross_device_id("A1", "cloud-77");
        f.index
            .upsert(
                &[ServerAssetRecord {
                    remote_id: "r-9".into(),
                    checksum: "different".into(),
                    original_filename: "IMG.HEIC".into(),
                    updated_at: Utc::now(),
                    cross_device_id: Some("cloud-77".into()),
                    asset_type: RemoteAssetType::Image,
                }],
                SyncType::Full,
            )
            .await
            .unwrap();
        mark_synced(&f.index, &[]).await;

        f.resolver
            .start_background_processing(&ids(&["A1"]), &CancellationToken::new())
            .await;
        assert_eq!(f.resolver.status("A1"), SyncStatus::Uploaded);
    }

    #[tokio::test]
    async fn test_unreadable_asset_errors_without_blocking_siblings() {
        let f = fixture();
        f.library.add_image("A1", b"one", None);
        f.library.add_image("A2", b"two", None);
        f.library.add_image("A3", b"three", None);
        f.library.make_unreadable("A2", ResourceKind::Primary);
        mark_synced(&f.index, &[]).await;

        let report = f
            .resolver
            .start_background_processing(&ids(&["A1", "A2", "A3"]), &CancellationToken::new())
            .await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.hashed, 2);
        assert_eq!(f.resolver.status("A2"), SyncStatus::Error);
        assert_eq!(f.resolver.status("A1"), SyncStatus::NotUploaded);
        assert_eq!(f.resolver.status("A3"), SyncStatus::NotUploaded);
        assert_eq!(f.resolver.status_counts().get(SyncStatus::NotUploaded), 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_resumes_from_store_contents() {
        let f = fixture();
        for id in ["A1", "A2", "A3"] {
            f.library.add_image(id, id.as_bytes(), None);
        }
        mark_synced(&f.index, &[]).await;
        let all = ids(&["A1", "A2", "A3"]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = f.resolver.start_background_processing(&all, &cancel).await;
        assert!(report.cancelled);
        assert_eq!(report.hashed, 0);

        let report = f
            .resolver
            .start_background_processing(&all, &CancellationToken::new())
            .await;
        assert!(!report.cancelled);
        assert_eq!(report.hashed, 3);
        assert_eq!(report.checked, 3);

        // Nothing left to do.
        let report = f
            .resolver
            .start_background_processing(&all, &CancellationToken::new())
            .await;
        assert_eq!(report.hashed, 0);
        assert_eq!(report.checked, 0);
        assert_eq!(f.library.reads(), 3);
    }

    #[tokio::test]
    async fn test_upload_completion_updates_status() {
        let f = fixture();
        f.library.add_video("V1", b"movie");
        mark_synced(&f.index, &[]).await;
        f.resolver
            .start_background_processing(&ids(&["V1"]), &CancellationToken::new())
            .await;
        assert_eq!(f.resolver.status("V1"), SyncStatus::NotUploaded);

        f.history
            .upsert(&new_upload_record(
                "V1",
                ResourceKind::Video,
                "V1.mov",
                "r-2",
                5,
                false,
                false,
            ))
            .await
            .unwrap();
        f.resolver.on_upload_completed("V1").await;
        assert_eq!(f.resolver.status("V1"), SyncStatus::Uploaded);
    }

    #[tokio::test]
    async fn test_removed_assets_leave_the_cache() {
        let f = fixture();
        f.library.add_image("A1", b"jpeg", None);
        f.resolver.refresh_all().await;
        assert_eq!(f.resolver.status_counts().total(), 1);

        f.library.remove("A1");
        f.resolver.refresh_all().await;
        assert_eq!(f.resolver.status_counts().total(), 0);
    }
}
