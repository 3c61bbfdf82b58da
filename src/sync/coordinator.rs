use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::error::SyncError;
use super::progress::{SyncOutcome, SyncPhase, SyncProgress, SyncReport};
use crate::remote::{
    ApiError, AssetServer, AssetServerFactory, DeltaSyncRequest, FullSyncRequest, RemoteAsset,
    ServerEndpoint,
};
use crate::retry::{self, RetryAction, RetryConfig, RetryError};
use crate::state::{ServerAssetRecord, ServerIndex, SyncMetadata, SyncType};

pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Progress callback handed to [`SyncCoordinator::sync`].
pub type ProgressFn<'a> = &'a (dyn Fn(SyncProgress) + Send + Sync);

/// Refreshes the server index from the remote server.
///
/// At most one sync runs at a time; a concurrent call returns
/// [`SyncOutcome::Skipped`] instead of waiting.
pub struct SyncCoordinator {
    factory: Arc<dyn AssetServerFactory>,
    index: Arc<dyn ServerIndex>,
    in_flight: AtomicBool,
    page_size: usize,
    retry: RetryConfig,
}

/// Clears the in-flight flag however the sync ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Account {
    user_id: String,
    /// The user followed by partner accounts.
    owner_ids: Vec<String>,
}

fn classify(e: &ApiError) -> RetryAction {
    if e.is_retryable() && !e.is_auth() {
        RetryAction::Retry
    } else {
        RetryAction::Abort
    }
}

/// Split a batch into live records and ids the server trashed.
fn partition(assets: &[RemoteAsset]) -> (Vec<ServerAssetRecord>, Vec<String>) {
    let mut live = Vec::with_capacity(assets.len());
    let mut trashed = Vec::new();
    for asset in assets {
        if asset.is_trashed {
            trashed.push(asset.id.clone());
        } else {
            live.push(asset.to_record());
        }
    }
    (live, trashed)
}

impl SyncCoordinator {
    pub fn new(
        factory: Arc<dyn AssetServerFactory>,
        index: Arc<dyn ServerIndex>,
        page_size: usize,
        retry: RetryConfig,
    ) -> Self {
        Self {
            factory,
            index,
            in_flight: AtomicBool::new(false),
            page_size: page_size.max(1),
            retry,
        }
    }

    #[cfg(test)]
    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one sync. Full when there is no previous sync or `force_full`
    /// is set, delta otherwise.
    ///
    /// Pages committed before a failure stay in the index; sync metadata is
    /// only written when the whole sync succeeds.
    pub async fn sync(
        &self,
        server_url: &str,
        api_key: &str,
        force_full: bool,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, SyncError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::info!("Sync already in progress, skipping");
            return Ok(SyncOutcome::Skipped);
        }
        let _guard = InFlightGuard(&self.in_flight);

        if api_key.trim().is_empty() {
            return Err(SyncError::MissingApiKey);
        }
        let endpoint =
            ServerEndpoint::new(server_url, api_key.trim()).map_err(SyncError::InvalidEndpoint)?;

        progress(SyncProgress::new(SyncPhase::Connecting));
        let server = self
            .factory
            .connect(&endpoint)
            .map_err(SyncError::InvalidEndpoint)?;
        self.call(cancel, || server.ping()).await?;

        let previous = self.index.sync_metadata().await?;
        let account = self.fetch_account(server.as_ref(), progress, cancel).await?;

        if let Some(previous) = previous.as_ref().filter(|_| !force_full) {
            if previous.user_id != account.user_id {
                tracing::info!(
                    previous_user = %previous.user_id,
                    user = %account.user_id,
                    "Server account changed, running full sync"
                );
            } else if let Some(report) = self
                .delta_sync(server.as_ref(), &account, previous.last_sync_time, progress, cancel)
                .await?
            {
                return Ok(SyncOutcome::Completed(report));
            }
        }

        let report = self
            .full_sync(server.as_ref(), &account, progress, cancel)
            .await?;
        Ok(SyncOutcome::Completed(report))
    }

    async fn call<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> Result<T, SyncError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        retry::retry_with_backoff(&self.retry, cancel, classify, op)
            .await
            .map_err(|e| match e {
                RetryError::Failed(e) => SyncError::Remote(e),
                RetryError::Cancelled => SyncError::Cancelled,
            })
    }

    async fn fetch_account(
        &self,
        server: &dyn AssetServer,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<Account, SyncError> {
        progress(SyncProgress::new(SyncPhase::FetchingUser));
        let user = self.call(cancel, || server.current_user()).await?;

        progress(SyncProgress::new(SyncPhase::FetchingPartners));
        let partners = self.call(cancel, || server.partners()).await?;

        let mut owner_ids = vec![user.id.clone()];
        owner_ids.extend(
            partners
                .into_iter()
                .map(|p| p.id)
                .filter(|id| *id != user.id),
        );
        tracing::debug!(user_id = %user.id, owners = owner_ids.len(), "Resolved account");
        Ok(Account {
            user_id: user.id,
            owner_ids,
        })
    }

    /// Returns `None` when the server asks for a full sync instead.
    async fn delta_sync(
        &self,
        server: &dyn AssetServer,
        account: &Account,
        since: DateTime<Utc>,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<Option<SyncReport>, SyncError> {
        let started_at = Utc::now();
        let mut update = SyncProgress {
            phase: SyncPhase::FetchingAssets,
            sync_type: Some(SyncType::Delta),
            fetched: 0,
        };
        progress(update);

        let request = DeltaSyncRequest {
            updated_after: since,
            user_ids: account.owner_ids.clone(),
        };
        let response = self.call(cancel, || server.delta_sync(&request)).await?;
        if response.needs_full_sync {
            tracing::info!("Server requested a full sync");
            return Ok(None);
        }

        update.fetched = (response.upserted.len() + response.deleted.len()) as u64;
        update.phase = SyncPhase::ApplyingChanges;
        progress(update);

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let (live, trashed) = partition(&response.upserted);
        self.index.upsert(&live, SyncType::Delta).await?;
        let mut deletions = response.deleted;
        deletions.extend(trashed);
        let deleted_count = self.index.delete(&deletions).await?;

        update.phase = SyncPhase::Finalizing;
        progress(update);
        let total_assets = self
            .finish(account, started_at, SyncType::Delta)
            .await?;

        update.phase = SyncPhase::Complete;
        progress(update);

        let report = SyncReport {
            sync_type: SyncType::Delta,
            total_assets,
            upserted_count: live.len() as u64,
            deleted_count,
        };
        tracing::info!(
            upserted = report.upserted_count,
            deleted = report.deleted_count,
            total = report.total_assets,
            "Delta sync complete"
        );
        Ok(Some(report))
    }

    async fn full_sync(
        &self,
        server: &dyn AssetServer,
        account: &Account,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let mut update = SyncProgress {
            phase: SyncPhase::FetchingAssets,
            sync_type: Some(SyncType::Full),
            fetched: 0,
        };
        progress(update);

        let mut upserted_count = 0u64;
        let mut seen: HashSet<String> = HashSet::new();
        for owner_id in &account.owner_ids {
            let mut last_id: Option<String> = None;
            loop {
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                let request = FullSyncRequest {
                    limit: self.page_size,
                    updated_until: started_at,
                    last_id: last_id.clone(),
                    user_id: owner_id.clone(),
                };
                let page = self.call(cancel, || server.full_sync_page(&request)).await?;

                let (live, _trashed) = partition(&page);
                self.index.upsert(&live, SyncType::Full).await?;
                seen.extend(live.iter().map(|r| r.remote_id.clone()));
                upserted_count += live.len() as u64;
                update.fetched += page.len() as u64;
                progress(update);

                if page.len() < self.page_size {
                    break;
                }
                last_id = page.last().map(|a| a.id.clone());
            }
        }

        update.phase = SyncPhase::Finalizing;
        progress(update);
        // Anything not listed by this pass is gone (or trashed) remotely.
        let deleted_count = self.index.retain_only(&seen).await?;
        let total_assets = self.finish(account, started_at, SyncType::Full).await?;

        update.phase = SyncPhase::Complete;
        progress(update);

        let report = SyncReport {
            sync_type: SyncType::Full,
            total_assets,
            upserted_count,
            deleted_count,
        };
        tracing::info!(
            fetched = update.fetched,
            pruned = report.deleted_count,
            total = report.total_assets,
            "Full sync complete"
        );
        Ok(report)
    }

    async fn finish(
        &self,
        account: &Account,
        started_at: DateTime<Utc>,
        sync_type: SyncType,
    ) -> Result<u64, SyncError> {
        let total_assets = self.index.count().await?;
        self.index
            .save_sync_metadata(&SyncMetadata {
                user_id: account.user_id.clone(),
                last_sync_time: started_at,
                total_assets,
                last_sync_type: sync_type,
            })
            .await?;
        Ok(total_assets)
    }
}
