//! Per-asset sync status.

pub mod resolver;
pub mod status;

pub use resolver::{DedupResolver, DEFAULT_BATCH_SIZE};
pub use status::SyncStatus;
