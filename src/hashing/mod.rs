//! Content hashing for dedup.

pub mod digest;
pub mod error;
pub mod store;

pub use digest::DEFAULT_CHUNK_SIZE;
pub use error::HashError;
pub use store::HashStore;
