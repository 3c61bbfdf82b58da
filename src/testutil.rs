//! In-memory fakes shared by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;

use crate::hashing::digest::to_hex;
use crate::library::{LibraryError, LocalAsset, LocalResource, MediaKind, PhotoInventory};
use crate::remote::types::{DeltaSyncResponse, Partner, UserInfo};
use crate::remote::{
    ApiError, AssetServer, AssetServerFactory, DeltaSyncRequest, FullSyncRequest, RemoteAsset,
    ServerEndpoint,
};
use crate::state::{ResourceKind, UploadHistory};
use crate::upload::destination::UploadDestination;
use crate::upload::host::{
    HostError, HostJob, HostJobState, ResourceRef, UploadHost, UploadReceipt,
};

pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

#[derive(Default)]
struct LibraryState {
    assets: BTreeMap<String, LocalAsset>,
    content: HashMap<(String, ResourceKind), Vec<u8>>,
    unreadable: HashSet<(String, ResourceKind)>,
    added: i64,
}

/// Photo library held in memory. Later additions are newer.
#[derive(Default)]
pub struct MemoryLibrary {
    state: Mutex<LibraryState>,
    reads: AtomicUsize,
}

impl MemoryLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        &self,
        id: &str,
        media: MediaKind,
        files: Vec<(ResourceKind, String, &[u8])>,
    ) -> LocalAsset {
        let mut state = self.state.lock().unwrap();
        state.added += 1;
        let created_at = Utc.timestamp_opt(1_700_000_000 + state.added * 60, 0).unwrap();
        let asset = LocalAsset {
            id: id.to_string(),
            media,
            created_at,
            modified_at: created_at,
            is_favorite: false,
            latitude: None,
            longitude: None,
            cross_device_id: None,
            resources: files
                .iter()
                .map(|(kind, filename, bytes)| LocalResource {
                    kind: *kind,
                    filename: filename.clone(),
                    size: bytes.len() as u64,
                })
                .collect(),
        };
        for (kind, _, bytes) in files {
            state.content.insert((id.to_string(), kind), bytes.to_vec());
        }
        state.assets.insert(id.to_string(), asset.clone());
        asset
    }

    pub fn add_image(&self, id: &str, primary: &[u8], raw: Option<&[u8]>) -> LocalAsset {
        let mut files = vec![(ResourceKind::Primary, format!("{id}.jpg"), primary)];
        if let Some(raw) = raw {
            files.push((ResourceKind::Raw, format!("{id}.dng"), raw));
        }
        self.insert(id, MediaKind::Image, files)
    }

    pub fn add_video(&self, id: &str, content: &[u8]) -> LocalAsset {
        self.insert(
            id,
            MediaKind::Video,
            vec![(ResourceKind::Video, format!("{id}.mov"), content)],
        )
    }

    pub fn remove(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.assets.remove(id);
        state.content.retain(|(asset_id, _), _| asset_id != id);
    }

    pub fn set_cross_device_id(&self, id: &str, cross_device_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(asset) = state.assets.get_mut(id) {
            asset.cross_device_id = Some(cross_device_id.to_string());
        }
    }

    pub fn set_favorite(&self, id: &str, favorite: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(asset) = state.assets.get_mut(id) {
            asset.is_favorite = favorite;
        }
    }

    /// Opening succeeds but reading fails.
    pub fn make_unreadable(&self, id: &str, kind: ResourceKind) {
        self.state
            .lock()
            .unwrap()
            .unreadable
            .insert((id.to_string(), kind));
    }

    /// Number of resources opened so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

struct FailingReader;

impl Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "unreadable"))
    }
}

#[async_trait]
impl PhotoInventory for MemoryLibrary {
    async fn asset(&self, asset_id: &str) -> Result<Option<LocalAsset>, LibraryError> {
        Ok(self.state.lock().unwrap().assets.get(asset_id).cloned())
    }

    async fn assets_newest_first(
        &self,
        media: MediaKind,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<LocalAsset>, LibraryError> {
        let state = self.state.lock().unwrap();
        let mut assets: Vec<LocalAsset> = state
            .assets
            .values()
            .filter(|a| a.media == media)
            .cloned()
            .collect();
        assets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(assets.into_iter().skip(offset).take(limit).collect())
    }

    async fn all_asset_ids(&self) -> Result<Vec<String>, LibraryError> {
        Ok(self.state.lock().unwrap().assets.keys().cloned().collect())
    }

    fn open_resource(
        &self,
        asset_id: &str,
        kind: ResourceKind,
    ) -> Result<Box<dyn Read + Send>, LibraryError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let key = (asset_id.to_string(), kind);
        if state.unreadable.contains(&key) {
            return Ok(Box::new(FailingReader));
        }
        match state.content.get(&key) {
            Some(bytes) => Ok(Box::new(io::Cursor::new(bytes.clone()))),
            None => Err(LibraryError::ResourceMissing {
                asset_id: asset_id.to_string(),
                kind,
            }),
        }
    }
}

#[derive(Default)]
struct ServerState {
    partners: Vec<String>,
    assets: BTreeMap<String, RemoteAsset>,
    deletions: Vec<(String, DateTime<Utc>)>,
    needs_full_sync: bool,
    failures: Option<(u16, usize)>,
    fail_page: Option<(usize, u16)>,
    checksum_error: Option<u16>,
    checksum_delay: Option<Duration>,
    holding: bool,
    full_page_calls: usize,
    delta_calls: usize,
    checksum_calls: usize,
}

/// Remote asset server held in memory, with failure injection.
pub struct FakeServer {
    user_id: String,
    state: Mutex<ServerState>,
    held: Notify,
    release: Notify,
}

struct FakeFactory(Arc<FakeServer>);

impl AssetServerFactory for FakeFactory {
    fn connect(&self, _endpoint: &ServerEndpoint) -> Result<Arc<dyn AssetServer>, ApiError> {
        Ok(self.0.clone())
    }
}

fn status_error(status: u16, endpoint: &str) -> ApiError {
    if status == 401 || status == 403 {
        ApiError::Unauthorized { status }
    } else {
        ApiError::Status {
            status,
            endpoint: endpoint.to_string(),
        }
    }
}

impl FakeServer {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            state: Mutex::new(ServerState::default()),
            held: Notify::new(),
            release: Notify::new(),
        }
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn AssetServerFactory> {
        Arc::new(FakeFactory(self.clone()))
    }

    pub fn add_partner(&self, id: &str) {
        self.state.lock().unwrap().partners.push(id.to_string());
    }

    /// Insert or replace an asset, stamping it as updated now.
    pub fn put_asset(&self, owner: &str, id: &str, checksum: &str) {
        self.state.lock().unwrap().assets.insert(
            id.to_string(),
            RemoteAsset {
                id: id.to_string(),
                checksum: checksum.to_string(),
                original_file_name: format!("{id}.jpg"),
                asset_type: "IMAGE".to_string(),
                updated_at: Utc::now(),
                owner_id: Some(owner.to_string()),
                cross_device_id: None,
                is_trashed: false,
            },
        );
    }

    pub fn trash_asset(&self, id: &str) {
        if let Some(asset) = self.state.lock().unwrap().assets.get_mut(id) {
            asset.is_trashed = true;
            asset.updated_at = Utc::now();
        }
    }

    pub fn delete_asset(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        if state.assets.remove(id).is_some() {
            state.deletions.push((id.to_string(), Utc::now()));
        }
    }

    pub fn set_needs_full_sync(&self, needs: bool) {
        self.state.lock().unwrap().needs_full_sync = needs;
    }

    /// Fail the next `count` requests of any kind with `status`.
    pub fn fail_requests(&self, status: u16, count: usize) {
        self.state.lock().unwrap().failures = Some((status, count));
    }

    /// Fail the `nth` full sync page request (1-based).
    pub fn fail_full_page(&self, nth: usize, status: u16) {
        self.state.lock().unwrap().fail_page = Some((nth, status));
    }

    pub fn fail_checksum_lookups(&self, status: Option<u16>) {
        self.state.lock().unwrap().checksum_error = status;
    }

    pub fn delay_checksum_lookups(&self, delay: Duration) {
        self.state.lock().unwrap().checksum_delay = Some(delay);
    }

    pub fn full_page_calls(&self) -> usize {
        self.state.lock().unwrap().full_page_calls
    }

    pub fn delta_calls(&self) -> usize {
        self.state.lock().unwrap().delta_calls
    }

    pub fn checksum_calls(&self) -> usize {
        self.state.lock().unwrap().checksum_calls
    }

    /// Make the next full sync page block until released.
    pub fn hold_full_pages(&self) {
        self.state.lock().unwrap().holding = true;
    }

    pub async fn wait_until_held(&self) {
        self.held.notified().await;
    }

    pub fn release_full_pages(&self) {
        self.state.lock().unwrap().holding = false;
        self.release.notify_one();
    }

    fn gate(&self, endpoint: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        if let Some((status, remaining)) = state.failures {
            if remaining > 0 {
                state.failures = Some((status, remaining - 1));
                return Err(status_error(status, endpoint));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AssetServer for FakeServer {
    async fn ping(&self) -> Result<(), ApiError> {
        self.gate("/server/ping")
    }

    async fn current_user(&self) -> Result<UserInfo, ApiError> {
        self.gate("/users/me")?;
        Ok(UserInfo {
            id: self.user_id.clone(),
            email: format!("{}@example.com", self.user_id),
            name: self.user_id.clone(),
        })
    }

    async fn partners(&self) -> Result<Vec<Partner>, ApiError> {
        self.gate("/partners")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .partners
            .iter()
            .map(|id| Partner {
                id: id.clone(),
                name: id.clone(),
            })
            .collect())
    }

    async fn full_sync_page(&self, request: &FullSyncRequest) -> Result<Vec<RemoteAsset>, ApiError> {
        self.gate("/sync/full-sync")?;
        let hold = {
            let mut state = self.state.lock().unwrap();
            state.full_page_calls += 1;
            if let Some((nth, status)) = state.fail_page {
                if state.full_page_calls == nth {
                    return Err(status_error(status, "/sync/full-sync"));
                }
            }
            state.holding
        };
        if hold {
            self.held.notify_one();
            self.release.notified().await;
        }

        let state = self.state.lock().unwrap();
        Ok(state
            .assets
            .values()
            .filter(|a| a.owner_id.as_deref() == Some(request.user_id.as_str()))
            .filter(|a| a.updated_at <= request.updated_until)
            .filter(|a| request.last_id.as_ref().map_or(true, |last| a.id > *last))
            .take(request.limit)
            .cloned()
            .collect())
    }

    async fn delta_sync(&self, request: &DeltaSyncRequest) -> Result<DeltaSyncResponse, ApiError> {
        self.gate("/sync/delta-sync")?;
        let mut state = self.state.lock().unwrap();
        state.delta_calls += 1;
        if state.needs_full_sync {
            return Ok(DeltaSyncResponse {
                needs_full_sync: true,
                ..Default::default()
            });
        }
        let upserted = state
            .assets
            .values()
            .filter(|a| {
                a.owner_id
                    .as_ref()
                    .is_some_and(|owner| request.user_ids.contains(owner))
            })
            .filter(|a| a.updated_at >= request.updated_after)
            .cloned()
            .collect();
        let deleted = state
            .deletions
            .iter()
            .filter(|(_, at)| *at >= request.updated_after)
            .map(|(id, _)| id.clone())
            .collect();
        Ok(DeltaSyncResponse {
            needs_full_sync: false,
            upserted,
            deleted,
        })
    }

    async fn checksum_exists(&self, checksum: &str) -> Result<Vec<RemoteAsset>, ApiError> {
        self.gate("/search/metadata")?;
        let (delay, error) = {
            let mut state = self.state.lock().unwrap();
            state.checksum_calls += 1;
            (state.checksum_delay, state.checksum_error)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = error {
            return Err(status_error(status, "/search/metadata"));
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .assets
            .values()
            .filter(|a| !a.is_trashed && a.to_record().checksum == checksum)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct HostState {
    jobs: BTreeMap<String, HostJob>,
    destinations: HashMap<String, UploadDestination>,
    registered: Vec<ResourceRef>,
    next_id: usize,
    quota: Option<usize>,
    ack_failures: usize,
    resubmissions: usize,
    acknowledged: Vec<String>,
}

/// Upload host held in memory. Transfers never run on their own; tests
/// move jobs along with [`FakeHost::complete_all`] and [`FakeHost::fail`].
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
    history: Mutex<Option<Arc<dyn UploadHistory>>>,
    violations: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(limit: usize) -> Self {
        let host = Self::default();
        host.state.lock().unwrap().quota = Some(limit);
        host
    }

    /// Fail the next `count` acknowledgements.
    pub fn fail_acknowledgements(&self, count: usize) {
        self.state.lock().unwrap().ack_failures = count;
    }

    /// Count acknowledgements that arrive before `history` holds the record.
    pub fn require_record_before_ack(&self, history: Arc<dyn UploadHistory>) {
        *self.history.lock().unwrap() = Some(history);
    }

    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    pub fn complete_all(&self) {
        let mut state = self.state.lock().unwrap();
        for job in state.jobs.values_mut() {
            if matches!(job.state, HostJobState::Pending | HostJobState::Uploading) {
                job.state = HostJobState::Completed(UploadReceipt {
                    remote_id: format!("remote-{}", job.id),
                    is_duplicate: false,
                });
            }
        }
    }

    pub fn fail(&self, job_id: &str, retryable: bool) {
        if let Some(job) = self.state.lock().unwrap().jobs.get_mut(job_id) {
            job.state = HostJobState::Failed {
                retryable,
                reason: "injected".into(),
            };
        }
    }

    pub fn job_for(&self, asset_id: &str, kind: ResourceKind) -> Option<HostJob> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .values()
            .find(|j| j.resource.asset_id == asset_id && j.resource.kind == kind)
            .cloned()
    }

    pub fn destination(&self, job_id: &str) -> Option<UploadDestination> {
        self.state.lock().unwrap().destinations.get(job_id).cloned()
    }

    /// Every successful registration, in order.
    pub fn registered(&self) -> Vec<ResourceRef> {
        self.state.lock().unwrap().registered.clone()
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().unwrap().jobs.len()
    }

    pub fn resubmissions(&self) -> usize {
        self.state.lock().unwrap().resubmissions
    }

    pub fn acknowledged(&self) -> Vec<String> {
        self.state.lock().unwrap().acknowledged.clone()
    }
}

#[async_trait]
impl UploadHost for FakeHost {
    async fn jobs(&self) -> Result<Vec<HostJob>, HostError> {
        Ok(self.state.lock().unwrap().jobs.values().cloned().collect())
    }

    async fn register(
        &self,
        resource: &ResourceRef,
        destination: &UploadDestination,
    ) -> Result<String, HostError> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.values().find(|j| j.resource == *resource) {
            return Ok(job.id.clone());
        }
        if let Some(limit) = state.quota {
            if state.jobs.len() >= limit {
                return Err(HostError::QuotaExceeded {
                    outstanding: state.jobs.len(),
                    limit,
                });
            }
        }
        state.next_id += 1;
        let id = format!("job-{:03}", state.next_id);
        state.jobs.insert(
            id.clone(),
            HostJob {
                id: id.clone(),
                resource: resource.clone(),
                state: HostJobState::Pending,
            },
        );
        state.destinations.insert(id.clone(), destination.clone());
        state.registered.push(resource.clone());
        Ok(id)
    }

    async fn resubmit(
        &self,
        job_id: &str,
        destination: &UploadDestination,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.get_mut(job_id) else {
            return Err(HostError::UnknownJob(job_id.to_string()));
        };
        job.state = HostJobState::Pending;
        state.destinations.insert(job_id.to_string(), destination.clone());
        state.resubmissions += 1;
        Ok(())
    }

    async fn acknowledge(&self, job_id: &str) -> Result<(), HostError> {
        let resource = {
            let mut state = self.state.lock().unwrap();
            if state.ack_failures > 0 {
                state.ack_failures -= 1;
                return Err(HostError::Unavailable("injected acknowledge failure".into()));
            }
            state.jobs.get(job_id).map(|j| j.resource.clone())
        };

        let history = self.history.lock().unwrap().clone();
        if let (Some(history), Some(resource)) = (history, resource.as_ref()) {
            let completed = self
                .job_state(job_id)
                .is_some_and(|s| matches!(s, HostJobState::Completed(_)));
            if completed {
                let recorded = history
                    .uploaded_for(&[resource.asset_id.clone()])
                    .await
                    .is_ok_and(|keys| {
                        keys.contains(&(resource.asset_id.clone(), resource.kind))
                    });
                if !recorded {
                    self.violations.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let mut state = self.state.lock().unwrap();
        state.jobs.remove(job_id);
        state.destinations.remove(job_id);
        state.acknowledged.push(job_id.to_string());
        Ok(())
    }
}

impl FakeHost {
    fn job_state(&self, job_id: &str) -> Option<HostJobState> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .get(job_id)
            .map(|j| j.state.clone())
    }
}
