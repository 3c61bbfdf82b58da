use std::collections::HashMap;
use std::sync::Arc;

use super::digest;
use super::error::HashError;
use crate::library::{LibraryError, PhotoInventory};
use crate::state::{HashCache, HashCacheRecord, ResourceKind, ServerCheck};

/// Content hashes of library resources, computed once and cached.
///
/// Hashing streams the resource on the blocking pool; the file is never
/// held in memory. A RAW hash is only stored once the primary hash exists,
/// so asking for a RAW hash on a fresh asset hashes the primary first.
pub struct HashStore {
    cache: Arc<dyn HashCache>,
    inventory: Arc<dyn PhotoInventory>,
    chunk_size: usize,
}

impl HashStore {
    pub fn new(
        cache: Arc<dyn HashCache>,
        inventory: Arc<dyn PhotoInventory>,
        chunk_size: usize,
    ) -> Self {
        Self {
            cache,
            inventory,
            chunk_size,
        }
    }

    /// Cached hash for `(asset_id, kind)`, computing and persisting it on a miss.
    pub async fn hash_of(&self, asset_id: &str, kind: ResourceKind) -> Result<String, HashError> {
        let cached = self.cache.get(asset_id).await?;
        if let Some(hash) = cached.as_ref().and_then(|r| r.hash_for(kind)) {
            return Ok(hash.to_string());
        }

        let asset = self
            .inventory
            .asset(asset_id)
            .await?
            .ok_or_else(|| LibraryError::AssetNotFound {
                asset_id: asset_id.to_string(),
            })?;
        if asset.resource(kind).is_none() {
            return Err(LibraryError::ResourceMissing {
                asset_id: asset_id.to_string(),
                kind,
            }
            .into());
        }
        let has_raw = asset.has_raw();

        if kind.is_raw() && cached.is_none() {
            let primary_kind = asset.primary_kind();
            let primary = self.compute(asset_id, primary_kind).await?;
            self.cache
                .store_hash(asset_id, primary_kind, &primary, has_raw)
                .await?;
        }

        let hash = self.compute(asset_id, kind).await?;
        self.cache.store_hash(asset_id, kind, &hash, has_raw).await?;
        Ok(hash)
    }

    async fn compute(&self, asset_id: &str, kind: ResourceKind) -> Result<String, HashError> {
        let inventory = Arc::clone(&self.inventory);
        let id = asset_id.to_string();
        let chunk_size = self.chunk_size;
        let started = std::time::Instant::now();

        let hash = tokio::task::spawn_blocking(move || {
            let reader = inventory.open_resource(&id, kind)?;
            digest::hash_reader(reader, chunk_size).map_err(|source| HashError::Io {
                asset_id: id,
                kind,
                source,
            })
        })
        .await??;

        tracing::debug!(
            asset_id = %asset_id,
            kind = %kind,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Computed content hash"
        );
        Ok(hash)
    }

    pub async fn record_server_check(
        &self,
        asset_id: &str,
        kind: ResourceKind,
        on_server: bool,
    ) -> Result<(), HashError> {
        self.cache
            .record_server_check(asset_id, kind, on_server)
            .await?;
        Ok(())
    }

    pub async fn record_server_checks(&self, checks: &[ServerCheck]) -> Result<(), HashError> {
        self.cache.record_server_checks(checks).await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn cached(&self, asset_id: &str) -> Result<Option<HashCacheRecord>, HashError> {
        Ok(self.cache.get(asset_id).await?)
    }

    pub async fn cached_many(
        &self,
        asset_ids: &[String],
    ) -> Result<HashMap<String, HashCacheRecord>, HashError> {
        Ok(self.cache.get_many(asset_ids).await?)
    }

    /// Hash rows still awaiting server confirmation.
    pub async fn unchecked(&self, limit: usize) -> Result<Vec<HashCacheRecord>, HashError> {
        Ok(self.cache.unchecked(limit).await?)
    }
}
