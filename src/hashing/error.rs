use thiserror::Error;

use crate::library::LibraryError;
use crate::state::{ResourceKind, StateError};

#[derive(Debug, Error)]
pub enum HashError {
    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Failed reading {kind} resource of {asset_id}: {source}")]
    Io {
        asset_id: String,
        kind: ResourceKind,
        source: std::io::Error,
    },

    #[error("Hashing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
