//! Record types persisted by the state stores.

use chrono::{DateTime, Utc};

/// Which resource of an asset a row refers to.
///
/// Primary and RAW resources of the same photo are hashed, uploaded and
/// confirmed independently. Videos have a single `Video` resource that
/// occupies the primary slot of the hash cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResourceKind {
    Primary = 0,
    Raw = 1,
    Video = 2,
}

impl ResourceKind {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Raw => "raw",
            Self::Video => "video",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(Self::Primary),
            "raw" => Some(Self::Raw),
            "video" => Some(Self::Video),
            _ => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource this device has successfully uploaded.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRecord {
    pub asset_id: String,
    pub filename: String,
    /// Asset id assigned by the remote server.
    pub remote_id: String,
    pub uploaded_at: DateTime<Utc>,
    pub file_size: u64,
    pub resource_kind: ResourceKind,
    /// The server already held this content and reported a duplicate.
    pub is_duplicate: bool,
    pub is_favorite: bool,
}

/// Cached content hashes of an asset plus remote-confirmation flags.
///
/// `primary_hash` always exists once the row exists; the RAW hash is filled
/// in separately because it is computed from a different resource.
#[derive(Debug, Clone, PartialEq)]
pub struct HashCacheRecord {
    pub asset_id: String,
    pub primary_hash: String,
    pub raw_hash: Option<String>,
    pub calculated_at: DateTime<Utc>,
    /// When the primary resource was last checked against the server.
    pub checked_at: Option<DateTime<Utc>>,
    /// When the RAW resource was last checked against the server.
    pub raw_checked_at: Option<DateTime<Utc>>,
    pub has_raw: bool,
    pub primary_on_server: bool,
    pub raw_on_server: bool,
}

impl HashCacheRecord {
    /// The cached hash for a resource kind, if computed.
    pub fn hash_for(&self, kind: ResourceKind) -> Option<&str> {
        match kind {
            ResourceKind::Raw => self.raw_hash.as_deref(),
            ResourceKind::Primary | ResourceKind::Video => Some(&self.primary_hash),
        }
    }

    pub fn on_server(&self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Raw => self.raw_on_server,
            ResourceKind::Primary | ResourceKind::Video => self.primary_on_server,
        }
    }

    pub fn is_checked(&self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Raw => self.raw_checked_at.is_some(),
            ResourceKind::Primary | ResourceKind::Video => self.checked_at.is_some(),
        }
    }

    /// Whether a hash is still missing for one of the asset's resources.
    #[cfg(test)]
    pub fn needs_hash(&self) -> bool {
        self.has_raw && self.raw_hash.is_none()
    }

    /// Whether any hashed resource still awaits server confirmation.
    #[cfg(test)]
    pub fn needs_check(&self) -> bool {
        if self.checked_at.is_none() {
            return true;
        }
        self.has_raw && (self.raw_hash.is_none() || self.raw_checked_at.is_none())
    }
}

/// Remote asset type as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteAssetType {
    Image,
    Video,
    Audio,
    Other,
}

impl RemoteAssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "IMAGE",
            Self::Video => "VIDEO",
            Self::Audio => "AUDIO",
            Self::Other => "OTHER",
        }
    }

    /// Lenient parse; unknown values map to `Other`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "IMAGE" => Self::Image,
            "VIDEO" => Self::Video,
            "AUDIO" => Self::Audio,
            _ => Self::Other,
        }
    }
}

/// Local replica of one remote asset.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerAssetRecord {
    pub remote_id: String,
    /// Lowercase hex content hash.
    pub checksum: String,
    pub original_filename: String,
    pub updated_at: DateTime<Utc>,
    pub cross_device_id: Option<String>,
    pub asset_type: RemoteAssetType,
}

/// How a sync pass refreshed the server index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    Full,
    Delta,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Delta => "delta",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "delta" => Some(Self::Delta),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for the last successful sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMetadata {
    pub user_id: String,
    /// Sync start time; the next delta asks for changes after this point.
    pub last_sync_time: DateTime<Utc>,
    pub total_assets: u64,
    pub last_sync_type: SyncType,
}

/// Counts reported by the hash cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashCacheSummary {
    pub hashed: u64,
    pub unchecked: u64,
    pub on_server: u64,
}
