use async_trait::async_trait;
use thiserror::Error;

use super::destination::UploadDestination;
use crate::state::ResourceKind;

/// One library resource addressed by an upload job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub asset_id: String,
    pub kind: ResourceKind,
}

impl ResourceRef {
    pub fn new(asset_id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            asset_id: asset_id.into(),
            kind,
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.asset_id, self.kind)
    }
}

/// What the server answered for a finished transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub remote_id: String,
    pub is_duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostJobState {
    Pending,
    Uploading,
    Completed(UploadReceipt),
    Failed { retryable: bool, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostJob {
    pub id: String,
    pub resource: ResourceRef,
    pub state: HostJobState,
}

#[derive(Debug, Error)]
pub enum HostError {
    /// Too many outstanding jobs. Not terminal; try again next invocation.
    #[error("Upload host quota exhausted ({outstanding}/{limit} jobs outstanding)")]
    QuotaExceeded { outstanding: usize, limit: usize },

    #[error("Upload host unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown upload job {0}")]
    UnknownJob(String),
}

/// The scheduler that owns transfers.
///
/// Jobs survive process restarts and are only forgotten once acknowledged.
/// The host may run transfers while no process of ours is alive.
#[async_trait]
pub trait UploadHost: Send + Sync {
    /// Every job not yet acknowledged.
    async fn jobs(&self) -> Result<Vec<HostJob>, HostError>;

    /// Register a new job, returning its id. Registering a resource that
    /// already has a job returns the existing id.
    async fn register(
        &self,
        resource: &ResourceRef,
        destination: &UploadDestination,
    ) -> Result<String, HostError>;

    /// Queue a failed job again with a fresh destination.
    async fn resubmit(&self, job_id: &str, destination: &UploadDestination)
        -> Result<(), HostError>;

    /// Forget a finished job. Acknowledging an unknown job is a no-op.
    async fn acknowledge(&self, job_id: &str) -> Result<(), HostError>;
}
