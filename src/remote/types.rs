//! Wire types for the remote asset server API.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hashing::digest::to_hex;
use crate::state::{RemoteAssetType, ServerAssetRecord};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAsset {
    pub id: String,
    pub checksum: String,
    #[serde(default)]
    pub original_file_name: String,
    #[serde(rename = "type", default = "default_asset_type")]
    pub asset_type: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default, alias = "cloudId")]
    pub cross_device_id: Option<String>,
    #[serde(default)]
    pub is_trashed: bool,
}

fn default_asset_type() -> String {
    "OTHER".to_string()
}

impl RemoteAsset {
    pub fn to_record(&self) -> ServerAssetRecord {
        ServerAssetRecord {
            remote_id: self.id.clone(),
            checksum: normalize_checksum(&self.checksum),
            original_filename: self.original_file_name.clone(),
            updated_at: self.updated_at,
            cross_device_id: self
                .cross_device_id
                .clone()
                .filter(|id| !id.trim().is_empty()),
            asset_type: RemoteAssetType::parse(&self.asset_type),
        }
    }
}

/// Normalize a server checksum to lowercase hex.
///
/// Servers report checksums either as hex or base64 of the digest bytes.
pub fn normalize_checksum(checksum: &str) -> String {
    let trimmed = checksum.trim();
    let looks_hex = !trimmed.is_empty()
        && trimmed.len() % 2 == 0
        && trimmed.chars().all(|c| c.is_ascii_hexdigit());
    if looks_hex {
        return trimmed.to_ascii_lowercase();
    }
    match base64::engine::general_purpose::STANDARD.decode(trimmed) {
        Ok(bytes) => to_hex(&bytes),
        Err(_) => trimmed.to_ascii_lowercase(),
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Partner {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// One keyset-paged request for a user's complete asset list.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FullSyncRequest {
    pub limit: usize,
    pub updated_until: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_id: Option<String>,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeltaSyncRequest {
    pub updated_after: DateTime<Utc>,
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeltaSyncResponse {
    #[serde(default)]
    pub needs_full_sync: bool,
    #[serde(default)]
    pub upserted: Vec<RemoteAsset>,
    #[serde(default)]
    pub deleted: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChecksumQuery<'a> {
    pub checksum: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChecksumSearchResponse {
    pub assets: ChecksumSearchPage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChecksumSearchPage {
    #[serde(default)]
    pub items: Vec<RemoteAsset>,
}
