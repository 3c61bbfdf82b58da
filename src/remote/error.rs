use thiserror::Error;

/// Typed remote API errors enabling retry classification.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid server URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("API key is not a valid header value")]
    InvalidApiKey,

    #[error("Server rejected credentials (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("HTTP error {status} from {endpoint}")]
    Status { status: u16, endpoint: String },

    #[error("Request to {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("Failed to decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ApiError {
    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => *status == 429 || *status >= 500,
            ApiError::Timeout { .. } => true,
            ApiError::Http(_) => true,
            ApiError::InvalidUrl { .. }
            | ApiError::InvalidApiKey
            | ApiError::Unauthorized { .. }
            | ApiError::Decode { .. } => false,
        }
    }

    /// Whether the server refused our credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. } | ApiError::InvalidApiKey)
    }

    pub(crate) fn from_send(endpoint: &str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            ApiError::Timeout {
                endpoint: endpoint.to_string(),
            }
        } else {
            ApiError::Http(source)
        }
    }
}
