//! Socket protocol for request sources
//!
//! Newline-delimited JSON over a Unix domain socket. Every message is tagged
//! by `type`; bodies travel base64-encoded.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::gateway::{RegistrationStatus, WorkerState};
use crate::http::body_base64;
use crate::http::{ErrorEntry, Request, RequestMode, Response, ResponseSource};

/// Protocol version for future compatibility
pub const PROTOCOL_VERSION: u32 = 1;

/// Commands sent by request sources
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Perform a request through the cache layer
    Fetch(FetchRequest),
    /// Get daemon status
    GetStatus,
    /// Install and activate a new cache version
    #[serde(rename_all = "camelCase")]
    Deploy {
        /// New version name
        version: String,
    },
}

/// A request as sent over the socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RequestMode>,
    #[serde(default, with = "body_base64")]
    pub body: Vec<u8>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl FetchRequest {
    /// Validate into a gateway request
    pub fn into_request(self) -> Result<Request, String> {
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| format!("Invalid method: {}", self.method))?;
        let url = Url::parse(&self.url).map_err(|e| format!("Invalid URL {}: {}", self.url, e))?;

        let mut request = Request::new(method, url);
        request.headers = self.headers;
        request.mode = self.mode;
        if !self.body.is_empty() {
            request.body = Some(self.body);
        }
        Ok(request)
    }
}

/// Replies sent back to request sources
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Reply {
    /// Success reply
    #[serde(rename_all = "camelCase")]
    Success {
        /// Optional success message
        message: Option<String>,
    },
    /// Error reply
    #[serde(rename_all = "camelCase")]
    Error {
        /// Error message
        error: String,
    },
    /// Response to a fetch command
    #[serde(rename_all = "camelCase")]
    Fetched {
        status: u16,
        headers: Vec<(String, String)>,
        #[serde(with = "body_base64")]
        body: Vec<u8>,
        source: ResponseSource,
    },
    /// Daemon state
    #[serde(rename_all = "camelCase")]
    Status {
        /// Protocol version
        version: u32,
        /// Active cache version, if any
        active_version: Option<String>,
        /// Lifecycle state of the active version
        state: Option<WorkerState>,
        /// Namespaces present in the store
        namespaces: Vec<String>,
        /// Connected request sources
        clients: usize,
        /// Background cache writes in flight
        pending_writes: usize,
        /// Origin connection health
        network_health: String,
        /// Recent transport errors
        recent_errors: Vec<ErrorInfo>,
    },
}

/// A recent transport error (for status replies)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub timestamp: u64,
    pub method: String,
    pub url: String,
    pub error: String,
}

impl From<ErrorEntry> for ErrorInfo {
    fn from(entry: ErrorEntry) -> Self {
        Self {
            timestamp: entry.timestamp,
            method: entry.method,
            url: entry.url,
            error: entry.error,
        }
    }
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Reply::Fetched {
            status: response.status,
            headers: response.headers,
            body: response.body,
            source: response.source,
        }
    }
}

impl From<RegistrationStatus> for Reply {
    fn from(status: RegistrationStatus) -> Self {
        Reply::Status {
            version: PROTOCOL_VERSION,
            active_version: status.active_version,
            state: status.state,
            namespaces: status.namespaces,
            clients: status.clients,
            pending_writes: status.pending_writes,
            network_health: status.network_health,
            recent_errors: status.recent_errors.into_iter().map(ErrorInfo::from).collect(),
        }
    }
}

/// Parse a JSON command from bytes
pub fn parse_command(data: &[u8]) -> Result<Command, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a reply to JSON bytes
pub fn serialize_reply(reply: &Reply) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(reply)?;
    json.push(b'\n'); // Add newline delimiter
    Ok(json)
}
