//! Client for the remote asset server.

pub mod client;
pub mod error;
pub mod types;

pub use client::{AssetServer, AssetServerFactory, HttpAssetServerFactory, ServerEndpoint};
pub use error::ApiError;
pub use types::{DeltaSyncRequest, FullSyncRequest, RemoteAsset};
