//! Upload destinations.
//!
//! The host replaces any request body with the raw resource bytes, so every
//! piece of asset metadata travels in request headers.

use std::sync::Arc;

use chrono::{Local, SecondsFormat};
use reqwest::Url;

use super::error::UploadError;
use crate::library::LocalAsset;
use crate::state::ResourceKind;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Where and how a host job sends one resource.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UploadDestination {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl UploadDestination {
    #[cfg(test)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Source of the server credential. Read again for every destination so a
/// rotated key is picked up by retried jobs.
pub trait CredentialProvider: Send + Sync {
    fn api_key(&self) -> Result<String, UploadError>;
}

/// A key fixed for the life of the process.
pub struct StaticCredentials(String);

impl StaticCredentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self(api_key.into())
    }
}

impl CredentialProvider for StaticCredentials {
    fn api_key(&self) -> Result<String, UploadError> {
        if self.0.trim().is_empty() {
            return Err(UploadError::Credentials("API key is empty".into()));
        }
        Ok(self.0.clone())
    }
}

pub struct DestinationBuilder {
    relay_url: Url,
    device_id: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl DestinationBuilder {
    pub fn new(
        relay_url: &str,
        device_id: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, UploadError> {
        let relay_url = Url::parse(relay_url).map_err(|e| UploadError::InvalidRelayUrl {
            url: relay_url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(relay_url.scheme(), "http" | "https") {
            return Err(UploadError::InvalidRelayUrl {
                url: relay_url.to_string(),
                reason: "scheme must be http or https".into(),
            });
        }
        Ok(Self {
            relay_url,
            device_id: device_id.into(),
            credentials,
        })
    }

    pub fn build(
        &self,
        asset: &LocalAsset,
        kind: ResourceKind,
    ) -> Result<UploadDestination, UploadError> {
        let filename = asset
            .resource(kind)
            .map(|r| r.filename.as_str())
            .unwrap_or_else(|| asset.filename());
        let api_key = self.credentials.api_key()?;

        let mut headers = vec![
            (API_KEY_HEADER.to_string(), api_key),
            ("x-device-asset-id".to_string(), device_asset_id(&asset.id, kind)),
            ("x-device-id".to_string(), self.device_id.clone()),
            (
                "x-file-created-at".to_string(),
                asset.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            (
                "x-file-modified-at".to_string(),
                asset.modified_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            ("x-is-favorite".to_string(), asset.is_favorite.to_string()),
            ("x-filename".to_string(), encode_header_value(filename)),
            ("content-type".to_string(), content_type(filename).to_string()),
            ("x-timezone".to_string(), Local::now().offset().to_string()),
            ("x-resource-kind".to_string(), kind.as_str().to_string()),
        ];
        if let Some(id) = asset.cross_device_id.as_deref() {
            headers.push(("x-cross-device-id".to_string(), encode_header_value(id)));
        }
        if let (Some(lat), Some(lon)) = (asset.latitude, asset.longitude) {
            headers.push(("x-latitude".to_string(), format!("{lat:.6}")));
            headers.push(("x-longitude".to_string(), format!("{lon:.6}")));
        }

        Ok(UploadDestination {
            url: self.relay_url.to_string(),
            headers,
        })
    }
}

/// RAW resources get their own device asset id so the server keeps both.
fn device_asset_id(asset_id: &str, kind: ResourceKind) -> String {
    if kind.is_raw() {
        format!("{asset_id}#raw")
    } else {
        asset_id.to_string()
    }
}

/// Percent-encode anything outside printable ASCII.
fn encode_header_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if (0x20..0x7f).contains(&byte) && byte != b'%' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn content_type(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        "dng" => "image/x-adobe-dng",
        "cr2" => "image/x-canon-cr2",
        "nef" => "image/x-nikon-nef",
        "arw" => "image/x-sony-arw",
        "raf" => "image/x-fuji-raf",
        "orf" => "image/x-olympus-orf",
        "rw2" => "image/x-panasonic-rw2",
        "mov" => "video/quicktime",
        "mp4" => "video/mp4",
        "m4v" => "video/x-m4v",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::library::{LocalResource, MediaKind};

    fn asset() -> LocalAsset {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        LocalAsset {
            id: "2024/IMG_0001.JPG".into(),
            media: MediaKind::Image,
            created_at: at,
            modified_at: at,
            is_favorite: true,
            latitude: Some(48.8584),
            longitude: Some(2.2945),
            cross_device_id: Some("cloud-1".into()),
            resources: vec![
                LocalResource {
                    kind: ResourceKind::Primary,
                    filename: "IMG_0001.JPG".into(),
                    size: 10,
                },
                LocalResource {
                    kind: ResourceKind::Raw,
                    filename: "IMG_0001.DNG".into(),
                    size: 20,
                },
            ],
        }
    }

    fn builder() -> DestinationBuilder {
        DestinationBuilder::new(
            "https://relay.example.com/upload",
            "device-1",
            Arc::new(StaticCredentials::new("secret")),
        )
        .unwrap()
    }

    #[test]
    fn test_metadata_travels_in_headers() {
        let dest = builder().build(&asset(), ResourceKind::Primary).unwrap();
        assert_eq!(dest.url, "https://relay.example.com/upload");
        assert_eq!(dest.header("x-api-key"), Some("secret"));
        assert_eq!(dest.header("x-device-asset-id"), Some("2024/IMG_0001.JPG"));
        assert_eq!(dest.header("x-device-id"), Some("device-1"));
        assert_eq!(
            dest.header("x-file-created-at"),
            Some("2024-05-01T12:30:00.000Z")
        );
        assert_eq!(dest.header("x-is-favorite"), Some("true"));
        assert_eq!(dest.header("x-filename"), Some("IMG_0001.JPG"));
        assert_eq!(dest.header("content-type"), Some("image/jpeg"));
        assert_eq!(dest.header("x-cross-device-id"), Some("cloud-1"));
        assert_eq!(dest.header("x-latitude"), Some("48.858400"));
        assert!(dest.header("x-timezone").is_some());
    }

    #[test]
    fn test_raw_destination_is_distinct() {
        let dest = builder().build(&asset(), ResourceKind::Raw).unwrap();
        assert_eq!(dest.header("x-device-asset-id"), Some("2024/IMG_0001.JPG#raw"));
        assert_eq!(dest.header("x-filename"), Some("IMG_0001.DNG"));
        assert_eq!(dest.header("content-type"), Some("image/x-adobe-dng"));
        assert_eq!(dest.header("x-resource-kind"), Some("raw"));
    }

    #[test]
    fn test_optional_headers_are_omitted() {
        let mut a = asset();
        a.cross_device_id = None;
        a.latitude = None;
        let dest = builder().build(&a, ResourceKind::Primary).unwrap();
        assert!(dest.header("x-cross-device-id").is_none());
        assert!(dest.header("x-latitude").is_none());
        assert!(dest.header("x-longitude").is_none());
    }

    #[test]
    fn test_non_ascii_values_are_percent_encoded() {
        assert_eq!(encode_header_value("Café 1.jpg"), "Caf%C3%A9 1.jpg");
        assert_eq!(encode_header_value("100%"), "100%25");
    }

    #[test]
    fn test_credentials_are_required() {
        let builder = DestinationBuilder::new(
            "https://relay.example.com",
            "device-1",
            Arc::new(StaticCredentials::new(" ")),
        )
        .unwrap();
        assert!(matches!(
            builder.build(&asset(), ResourceKind::Primary),
            Err(UploadError::Credentials(_))
        ));
    }

    #[test]
    fn test_relay_url_is_validated() {
        let creds: Arc<dyn CredentialProvider> = Arc::new(StaticCredentials::new("k"));
        assert!(DestinationBuilder::new("not a url", "d", creds.clone()).is_err());
        assert!(DestinationBuilder::new("ftp://relay", "d", creds).is_err());
    }
}
