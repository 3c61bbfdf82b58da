use thiserror::Error;

use super::host::HostError;
use crate::hashing::HashError;
use crate::library::LibraryError;
use crate::state::StateError;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Store(#[from] StateError),

    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error("No credentials available: {0}")]
    Credentials(String),

    #[error("Invalid relay URL {url}: {reason}")]
    InvalidRelayUrl { url: String, reason: String },
}

impl UploadError {
    /// The host ran out of job slots; work resumes on the next invocation.
    pub fn is_quota(&self) -> bool {
        matches!(self, UploadError::Host(HostError::QuotaExceeded { .. }))
    }
}
