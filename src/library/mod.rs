//! Local photo library access.
//!
//! The engine only sees the library through [`PhotoInventory`]; the
//! directory-backed [`FsLibrary`] is the adapter used by the binary.

pub mod error;
pub mod exif;
pub mod fs;

use std::io::Read;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::state::ResourceKind;

pub use error::LibraryError;
pub use fs::FsLibrary;

/// Top-level media type of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Image,
    Video,
}

/// One stored file backing an asset.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalResource {
    pub kind: ResourceKind,
    pub filename: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalAsset {
    pub id: String,
    pub media: MediaKind,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub is_favorite: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Durable identifier that survives export/import across devices.
    pub cross_device_id: Option<String>,
    pub resources: Vec<LocalResource>,
}

impl LocalAsset {
    /// The resource kind that occupies the primary hash slot.
    pub fn primary_kind(&self) -> ResourceKind {
        match self.media {
            MediaKind::Image => ResourceKind::Primary,
            MediaKind::Video => ResourceKind::Video,
        }
    }

    pub fn has_raw(&self) -> bool {
        self.resources.iter().any(|r| r.kind.is_raw())
    }

    pub fn resource(&self, kind: ResourceKind) -> Option<&LocalResource> {
        self.resources.iter().find(|r| r.kind == kind)
    }

    /// Filename of the primary resource.
    pub fn filename(&self) -> &str {
        self.resource(self.primary_kind())
            .map(|r| r.filename.as_str())
            .unwrap_or(self.id.as_str())
    }
}

/// Read access to the local photo library.
#[async_trait]
pub trait PhotoInventory: Send + Sync {
    async fn asset(&self, asset_id: &str) -> Result<Option<LocalAsset>, LibraryError>;

    /// Page of assets of one media kind, newest first.
    async fn assets_newest_first(
        &self,
        media: MediaKind,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<LocalAsset>, LibraryError>;

    async fn all_asset_ids(&self) -> Result<Vec<String>, LibraryError>;

    /// Open a resource's bytes for streaming. Blocking; call from a
    /// blocking context.
    fn open_resource(
        &self,
        asset_id: &str,
        kind: ResourceKind,
    ) -> Result<Box<dyn Read + Send>, LibraryError>;
}
