//! Keeps the local server index in step with the remote server.

pub mod coordinator;
pub mod error;
pub mod progress;

pub use coordinator::{SyncCoordinator, DEFAULT_PAGE_SIZE};
pub use progress::{SyncOutcome, SyncProgress};
