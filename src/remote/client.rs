use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::ApiError;
use super::types::{
    ChecksumQuery, ChecksumSearchResponse, DeltaSyncRequest, DeltaSyncResponse, FullSyncRequest,
    Partner, RemoteAsset, UserInfo,
};

const USER_AGENT: &str = concat!("photosync/", env!("CARGO_PKG_VERSION"));
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Server base URL (already normalized to end in `/api`) plus API key.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub url: String,
    pub api_key: String,
}

impl std::fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl ServerEndpoint {
    pub fn new(url: &str, api_key: &str) -> Result<Self, ApiError> {
        Ok(Self {
            url: normalize_server_url(url)?,
            api_key: api_key.to_string(),
        })
    }
}

/// Validate a server URL and normalize it to `<scheme>://<host>[/path]/api`.
pub fn normalize_server_url(raw: &str) -> Result<String, ApiError> {
    let invalid = |reason: &str| ApiError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty"));
    }
    let parsed = reqwest::Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host"));
    }

    let base = trimmed.trim_end_matches('/');
    if base.ends_with("/api") {
        Ok(base.to_string())
    } else {
        Ok(format!("{base}/api"))
    }
}

/// Operations the sync engine needs from the remote asset server.
#[async_trait]
pub trait AssetServer: Send + Sync {
    async fn ping(&self) -> Result<(), ApiError>;

    async fn current_user(&self) -> Result<UserInfo, ApiError>;

    /// Accounts that share their library with the current user.
    async fn partners(&self) -> Result<Vec<Partner>, ApiError>;

    /// One page of a user's assets. An empty or short page ends the listing.
    async fn full_sync_page(&self, request: &FullSyncRequest)
        -> Result<Vec<RemoteAsset>, ApiError>;

    async fn delta_sync(&self, request: &DeltaSyncRequest)
        -> Result<DeltaSyncResponse, ApiError>;

    /// Remote assets whose checksum matches; empty means absent.
    async fn checksum_exists(&self, checksum: &str) -> Result<Vec<RemoteAsset>, ApiError>;
}

/// Builds an [`AssetServer`] for an endpoint. Each sync call connects anew so
/// a changed URL or key takes effect immediately.
pub trait AssetServerFactory: Send + Sync {
    fn connect(&self, endpoint: &ServerEndpoint) -> Result<Arc<dyn AssetServer>, ApiError>;
}

#[derive(Debug, Clone)]
pub struct HttpAssetServerFactory {
    timeout: Duration,
}

impl HttpAssetServerFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpAssetServerFactory {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl AssetServerFactory for HttpAssetServerFactory {
    fn connect(&self, endpoint: &ServerEndpoint) -> Result<Arc<dyn AssetServer>, ApiError> {
        Ok(Arc::new(HttpAssetServer::new(endpoint, self.timeout)?))
    }
}

/// `reqwest`-backed client speaking the server's JSON API.
#[derive(Debug, Clone)]
pub struct HttpAssetServer {
    client: Client,
    base_url: String,
}

impl HttpAssetServer {
    pub fn new(endpoint: &ServerEndpoint, timeout: Duration) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        let mut key =
            HeaderValue::from_str(&endpoint.api_key).map_err(|_| ApiError::InvalidApiKey)?;
        key.set_sensitive(true);
        headers.insert("x-api-key", key);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: endpoint.url.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| ApiError::from_send(path, e))?;
        decode(path, check_status(path, response)?).await
    }

    async fn post_json<B: Serialize + ?Sized + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::from_send(path, e))?;
        decode(path, check_status(path, response)?).await
    }
}

fn check_status(endpoint: &str, response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ApiError::Unauthorized {
            status: status.as_u16(),
        });
    }
    if !status.is_success() {
        return Err(ApiError::Status {
            status: status.as_u16(),
            endpoint: endpoint.to_string(),
        });
    }
    Ok(response)
}

async fn decode<T: DeserializeOwned>(endpoint: &str, response: Response) -> Result<T, ApiError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::from_send(endpoint, e))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl AssetServer for HttpAssetServer {
    async fn ping(&self) -> Result<(), ApiError> {
        let _: serde_json::Value = self.get_json("/server/ping").await?;
        Ok(())
    }

    async fn current_user(&self) -> Result<UserInfo, ApiError> {
        self.get_json("/users/me").await
    }

    async fn partners(&self) -> Result<Vec<Partner>, ApiError> {
        self.get_json("/partners?direction=shared-with").await
    }

    async fn full_sync_page(
        &self,
        request: &FullSyncRequest,
    ) -> Result<Vec<RemoteAsset>, ApiError> {
        self.post_json("/sync/full-sync", request).await
    }

    async fn delta_sync(&self, request: &DeltaSyncRequest) -> Result<DeltaSyncResponse, ApiError> {
        self.post_json("/sync/delta-sync", request).await
    }

    async fn checksum_exists(&self, checksum: &str) -> Result<Vec<RemoteAsset>, ApiError> {
        let response: ChecksumSearchResponse = self
            .post_json("/search/metadata", &ChecksumQuery { checksum })
            .await?;
        Ok(response.assets.items)
    }
}
