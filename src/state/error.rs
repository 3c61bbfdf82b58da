use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Cannot open state database {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Schema setup or a connection pragma failed.
    #[error("State schema setup failed: {0}")]
    Migration(#[from] rusqlite::Error),

    #[error("State query failed: {0}")]
    Query(String),

    #[error("State task did not complete: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    /// Written by a newer build; refusing to touch it.
    #[error("State database is at schema version {found}, this build understands up to {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// RAW hashes and server confirmations need the asset's row to exist.
    #[error("No cached hash for asset {asset_id}")]
    MissingHash { asset_id: String },
}

impl StateError {
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}
