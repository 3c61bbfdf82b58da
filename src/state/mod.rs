//! Persistent state for the sync engine.
//!
//! Three SQLite-backed stores share one database file, each on its own
//! connection and owning its own tables:
//! - `UploadHistory`: resources this device uploaded
//! - `HashCache`: content hashes and per-resource server confirmations
//! - `ServerIndex`: local replica of the remote asset list

pub mod db;
pub mod error;
pub mod hash_cache;
pub mod schema;
pub mod server_index;
pub mod types;
pub mod upload_history;

pub use error::StateError;
pub use hash_cache::{HashCache, ServerCheck, SqliteHashCache};
pub use server_index::{ServerIndex, SqliteServerIndex};
pub use types::{
    HashCacheRecord, RemoteAssetType, ResourceKind, ServerAssetRecord, SyncMetadata, SyncType,
};
pub use upload_history::{new_upload_record, SqliteUploadHistory, UploadHistory};
