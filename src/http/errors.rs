//! Network Error Types
//!
//! Structured errors for requests that leave the gateway.
//! Maps transport failures and HTTP status codes to specific variants so the
//! bootstrapper and the health tracker can tell them apart.

/// Network error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Failed to read response body: {0}")]
    Body(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Unexpected status ({0}): {1}")]
    Status(u16, String),

    #[error("Invalid request: {0}")]
    Request(String),
}

impl NetworkError {
    /// Create a NetworkError from a non-success HTTP status
    ///
    /// Only used where a status is itself a failure (shell install). The
    /// strategies treat any resolved response as a success.
    pub fn from_status(status: u16, url: &str) -> Self {
        match status {
            404 | 410 => NetworkError::NotFound(url.to_string()),
            408 | 504 => NetworkError::Timeout,
            500..=599 => NetworkError::Server(status, url.to_string()),
            _ => NetworkError::Status(status, url.to_string()),
        }
    }
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NetworkError::Timeout
        } else if err.is_connect() {
            NetworkError::Connect(err.to_string())
        } else if err.is_body() || err.is_decode() {
            NetworkError::Body(err.to_string())
        } else if err.is_builder() {
            NetworkError::Request(err.to_string())
        } else {
            NetworkError::Connect(err.to_string())
        }
    }
}
