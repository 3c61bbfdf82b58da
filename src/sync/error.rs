use thiserror::Error;

use crate::remote::ApiError;
use crate::state::StateError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid server endpoint: {0}")]
    InvalidEndpoint(#[source] ApiError),

    #[error("An API key is required to sync")]
    MissingApiKey,

    #[error("Remote server error: {0}")]
    Remote(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] StateError),

    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Remote(e) if e.is_auth())
    }
}
