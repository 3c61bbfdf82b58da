use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::destination::DestinationBuilder;
use super::error::UploadError;
use super::host::{HostJob, HostJobState, ResourceRef, UploadHost, UploadReceipt};
use crate::hashing::{HashError, HashStore};
use crate::library::{LocalAsset, MediaKind, PhotoInventory};
use crate::remote::AssetServer;
use crate::state::{new_upload_record, ResourceKind, ServerIndex, UploadHistory};

#[derive(Debug, Clone)]
pub struct UploadJobConfig {
    /// Most resources hashed and resolved (job created or found on the
    /// server) per invocation. Unreadable resources do not count.
    pub discovery_ceiling: usize,
    /// Most candidate resources listed per invocation, readable or not.
    pub discovery_scan_limit: usize,
    pub discovery_page_size: usize,
    /// Bound on the live checksum lookup. A timeout counts as "not found".
    pub checksum_timeout: Duration,
}

impl Default for UploadJobConfig {
    fn default() -> Self {
        Self {
            discovery_ceiling: 50,
            discovery_scan_limit: 500,
            discovery_page_size: 100,
            checksum_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub resubmitted: usize,
    /// Permanently failed jobs dropped so the resource can be rediscovered.
    pub dropped: usize,
    pub acknowledged: usize,
    /// Assets with at least one resource acknowledged in this invocation.
    pub acknowledged_assets: Vec<String>,
    pub created: usize,
    pub already_on_server: usize,
    pub unreadable: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Finished(ProcessReport),
    /// The host ran out of job slots; the rest waits for the next invocation.
    StillProcessing(ProcessReport),
    Cancelled(ProcessReport),
}

impl ProcessOutcome {
    pub fn report(&self) -> &ProcessReport {
        match self {
            Self::Finished(r) | Self::StillProcessing(r) | Self::Cancelled(r) => r,
        }
    }
}

enum Flow {
    Continue,
    Cancelled,
}

/// Background upload lifecycle: retry failed jobs, acknowledge completed
/// ones, then create new jobs for resources the server lacks.
///
/// Every step is safe to repeat, so an invocation killed at any point is
/// recovered by the next one. No backoff state is kept between
/// invocations; the host decides when to run us again.
pub struct UploadJobManager {
    host: Arc<dyn UploadHost>,
    inventory: Arc<dyn PhotoInventory>,
    hashes: Arc<HashStore>,
    history: Arc<dyn UploadHistory>,
    index: Arc<dyn ServerIndex>,
    server: Arc<dyn AssetServer>,
    destinations: DestinationBuilder,
    config: UploadJobConfig,
}

impl UploadJobManager {
    pub fn new(
        host: Arc<dyn UploadHost>,
        inventory: Arc<dyn PhotoInventory>,
        hashes: Arc<HashStore>,
        history: Arc<dyn UploadHistory>,
        index: Arc<dyn ServerIndex>,
        server: Arc<dyn AssetServer>,
        destinations: DestinationBuilder,
    ) -> Self {
        Self {
            host,
            inventory,
            hashes,
            history,
            index,
            server,
            destinations,
            config: UploadJobConfig::default(),
        }
    }

    pub fn with_config(mut self, config: UploadJobConfig) -> Self {
        self.config = config;
        self
    }

    /// Run one invocation.
    ///
    /// Host quota exhaustion ends the invocation early as
    /// [`ProcessOutcome::StillProcessing`]. Any other error ends it with
    /// `Err`; the next invocation picks up from the persisted state.
    pub async fn process(&self, cancel: &CancellationToken) -> Result<ProcessOutcome, UploadError> {
        let mut report = ProcessReport::default();
        match self.run(cancel, &mut report).await {
            Ok(Flow::Continue) => {
                tracing::info!(
                    resubmitted = report.resubmitted,
                    acknowledged = report.acknowledged,
                    created = report.created,
                    on_server = report.already_on_server,
                    "Upload invocation finished"
                );
                Ok(ProcessOutcome::Finished(report))
            }
            Ok(Flow::Cancelled) => {
                tracing::info!("Upload invocation cancelled");
                Ok(ProcessOutcome::Cancelled(report))
            }
            Err(e) if e.is_quota() => {
                tracing::info!(error = %e, created = report.created, "Upload host is full, deferring");
                Ok(ProcessOutcome::StillProcessing(report))
            }
            Err(e) => Err(e),
        }
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        report: &mut ProcessReport,
    ) -> Result<Flow, UploadError> {
        let jobs = self.host.jobs().await?;
        tracing::debug!(jobs = jobs.len(), "Host reported jobs");

        if let Flow::Cancelled = self.retry_failed_jobs(&jobs, cancel, report).await? {
            return Ok(Flow::Cancelled);
        }
        if cancel.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        if let Flow::Cancelled = self.acknowledge_completed_jobs(&jobs, cancel, report).await? {
            return Ok(Flow::Cancelled);
        }
        if cancel.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        self.create_new_upload_jobs(cancel, report).await
    }

    /// Resubmit retryable failures with a fresh destination. Permanent
    /// failures are dropped so discovery can try the resource again.
    async fn retry_failed_jobs(
        &self,
        jobs: &[HostJob],
        cancel: &CancellationToken,
        report: &mut ProcessReport,
    ) -> Result<Flow, UploadError> {
        for job in jobs {
            let HostJobState::Failed { retryable, reason } = &job.state else {
                continue;
            };
            if cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }

            let asset = self.inventory.asset(&job.resource.asset_id).await?;
            match asset {
                Some(asset) if *retryable => {
                    let destination = self.destinations.build(&asset, job.resource.kind)?;
                    self.host.resubmit(&job.id, &destination).await?;
                    report.resubmitted += 1;
                    tracing::debug!(job_id = %job.id, resource = %job.resource, "Resubmitted failed job");
                }
                _ => {
                    tracing::warn!(
                        job_id = %job.id,
                        resource = %job.resource,
                        reason = %reason,
                        "Dropping failed upload job"
                    );
                    self.host.acknowledge(&job.id).await?;
                    report.dropped += 1;
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Record each completed job locally, then acknowledge it. The record
    /// is durable before the host forgets the job.
    async fn acknowledge_completed_jobs(
        &self,
        jobs: &[HostJob],
        cancel: &CancellationToken,
        report: &mut ProcessReport,
    ) -> Result<Flow, UploadError> {
        for job in jobs {
            let HostJobState::Completed(receipt) = &job.state else {
                continue;
            };
            if cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            self.record_upload(&job.resource, receipt).await?;
            self.host.acknowledge(&job.id).await?;
            report.acknowledged += 1;
            if !report.acknowledged_assets.contains(&job.resource.asset_id) {
                report.acknowledged_assets.push(job.resource.asset_id.clone());
            }
        }
        Ok(Flow::Continue)
    }

    async fn record_upload(
        &self,
        resource: &ResourceRef,
        receipt: &UploadReceipt,
    ) -> Result<(), UploadError> {
        let asset = self.inventory.asset(&resource.asset_id).await?;
        let (filename, size, favorite) = match asset.as_ref() {
            Some(asset) => match asset.resource(resource.kind) {
                Some(r) => (r.filename.clone(), r.size, asset.is_favorite),
                None => (asset.filename().to_string(), 0, asset.is_favorite),
            },
            None => (resource.asset_id.clone(), 0, false),
        };

        let record = new_upload_record(
            &resource.asset_id,
            resource.kind,
            &filename,
            &receipt.remote_id,
            size,
            receipt.is_duplicate,
            favorite,
        );
        self.history.upsert(&record).await?;

        if let Err(e) = self
            .hashes
            .record_server_check(&resource.asset_id, resource.kind, true)
            .await
        {
            tracing::debug!(resource = %resource, error = %e, "Could not flag uploaded resource in hash cache");
        }
        tracing::debug!(
            resource = %resource,
            remote_id = %receipt.remote_id,
            duplicate = receipt.is_duplicate,
            "Recorded completed upload"
        );
        Ok(())
    }

    async fn create_new_upload_jobs(
        &self,
        cancel: &CancellationToken,
        report: &mut ProcessReport,
    ) -> Result<Flow, UploadError> {
        let existing: HashSet<ResourceRef> = self
            .host
            .jobs()
            .await?
            .into_iter()
            .map(|job| job.resource)
            .collect();

        let Some(candidates) = self.discover(&existing, cancel).await? else {
            return Ok(Flow::Cancelled);
        };
        tracing::debug!(candidates = candidates.len(), "Discovered upload candidates");

        let mut resolved = 0;
        for (asset, kind) in candidates {
            if resolved >= self.config.discovery_ceiling {
                break;
            }
            if cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }

            let hash = match self.hashes.hash_of(&asset.id, kind).await {
                Ok(hash) => hash,
                Err(HashError::State(e)) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(asset_id = %asset.id, kind = %kind, error = %e, "Skipping unreadable resource");
                    report.unreadable += 1;
                    continue;
                }
            };

            resolved += 1;

            if self.index.lookup_by_checksum(&hash).await?.is_some() {
                self.flag_on_server(&asset.id, kind, true).await;
                report.already_on_server += 1;
                continue;
            }
            match self.live_lookup(&hash).await {
                Some(true) => {
                    self.flag_on_server(&asset.id, kind, true).await;
                    report.already_on_server += 1;
                    continue;
                }
                Some(false) => self.flag_on_server(&asset.id, kind, false).await,
                None => {}
            }

            let destination = self.destinations.build(&asset, kind)?;
            let resource = ResourceRef::new(asset.id.clone(), kind);
            let job_id = self.host.register(&resource, &destination).await?;
            report.created += 1;
            tracing::debug!(job_id = %job_id, resource = %resource, "Created upload job");
        }
        Ok(Flow::Continue)
    }

    /// Newest-first scan, images before videos, stopping at the scan limit.
    /// Returns `None` if cancelled.
    async fn discover(
        &self,
        existing: &HashSet<ResourceRef>,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<(LocalAsset, ResourceKind)>>, UploadError> {
        let limit = self
            .config
            .discovery_scan_limit
            .max(self.config.discovery_ceiling);
        let page_size = self.config.discovery_page_size.max(1);
        let uploaded = self.history.uploaded_keys().await?;
        let mut candidates = Vec::new();
        if self.config.discovery_ceiling == 0 {
            return Ok(Some(candidates));
        }

        for media in [MediaKind::Image, MediaKind::Video] {
            let mut offset = 0;
            loop {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                let page = self
                    .inventory
                    .assets_newest_first(media, offset, page_size)
                    .await?;
                if page.is_empty() {
                    break;
                }
                offset += page.len();

                let ids: Vec<String> = page.iter().map(|a| a.id.clone()).collect();
                let records = self.hashes.cached_many(&ids).await?;
                let cached: Vec<String> = records
                    .values()
                    .flat_map(|r| [Some(r.primary_hash.clone()), r.raw_hash.clone()])
                    .flatten()
                    .collect();
                let indexed = self.index.contains_checksums(&cached).await?;

                for asset in &page {
                    let record = records.get(&asset.id);
                    let cross_device_match = match asset.cross_device_id.as_deref() {
                        Some(id) => self.index.lookup_by_cross_device_id(id).await?.is_some(),
                        None => false,
                    };

                    for resource in &asset.resources {
                        let kind = resource.kind;
                        if uploaded.contains(&(asset.id.clone(), kind))
                            || existing.contains(&ResourceRef::new(asset.id.clone(), kind))
                        {
                            continue;
                        }
                        if let Some(record) = record {
                            if record.on_server(kind) {
                                continue;
                            }
                            if record.hash_for(kind).is_some_and(|h| indexed.contains(h)) {
                                continue;
                            }
                        }
                        if cross_device_match && !kind.is_raw() {
                            continue;
                        }

                        candidates.push((asset.clone(), kind));
                        if candidates.len() >= limit {
                            return Ok(Some(candidates));
                        }
                    }
                }

                if page.len() < page_size {
                    break;
                }
            }
        }
        Ok(Some(candidates))
    }

    /// `Some(found)` when the server answered in time, `None` otherwise.
    async fn live_lookup(&self, hash: &str) -> Option<bool> {
        match tokio::time::timeout(self.config.checksum_timeout, self.server.checksum_exists(hash))
            .await
        {
            Ok(Ok(assets)) => Some(assets.iter().any(|a| !a.is_trashed)),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Checksum lookup failed, treating as not found");
                None
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.config.checksum_timeout.as_secs_f64(),
                    "Checksum lookup timed out, treating as not found"
                );
                None
            }
        }
    }

    async fn flag_on_server(&self, asset_id: &str, kind: ResourceKind, on_server: bool) {
        if let Err(e) = self
            .hashes
            .record_server_check(asset_id, kind, on_server)
            .await
        {
            tracing::warn!(asset_id, kind = %kind, error = %e, "Could not record server check");
        }
    }
}
