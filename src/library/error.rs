use std::path::PathBuf;

use thiserror::Error;

use crate::state::ResourceKind;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Asset not found in library: {asset_id}")]
    AssetNotFound { asset_id: String },

    #[error("Asset {asset_id} has no {kind} resource")]
    ResourceMissing {
        asset_id: String,
        kind: ResourceKind,
    },

    #[error("Library root {0} is not a directory")]
    InvalidRoot(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Library scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl LibraryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
