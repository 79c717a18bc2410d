//! Request/response types shared by the gateway, the stores and the network
//!
//! Defines the in-flight request and response shapes, the cache key derived
//! from a request, and the persisted form of a cached response.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// How the request source described the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestMode {
    /// Top-level document load
    Navigate,
    /// Anything else: scripts, styles, API calls, images
    Resource,
}

impl RequestMode {
    /// Parse a fetch-mode string as sent by browsers and request sources
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("navigate") {
            RequestMode::Navigate
        } else {
            RequestMode::Resource
        }
    }
}

/// An outgoing request as seen by the gateway
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method
    pub method: Method,
    /// Absolute request URL
    pub url: Url,
    /// Request headers (name, value)
    pub headers: Vec<(String, String)>,
    /// Request body, only meaningful for pass-through methods
    pub body: Option<Vec<u8>>,
    /// Mode stated by the source; `None` means infer it from the headers
    pub mode: Option<RequestMode>,
}

impl Request {
    /// Create a request with no headers, body or stated mode
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
            mode: None,
        }
    }

    /// Shorthand for a GET request
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Shorthand for a top-level document load
    pub fn navigate(url: Url) -> Self {
        Self::get(url).with_mode(RequestMode::Navigate)
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Where the bytes of a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseSource {
    /// Live network response
    Network,
    /// Served from the active cache namespace
    Cache,
    /// Offline-fallback document (or the synthetic offline response)
    Fallback,
}

/// A response handed back to the request source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Response headers (name, value)
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
    /// Where this response was served from
    pub source: ResponseSource,
}

impl Response {
    /// Create a network response with no headers
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            source: ResponseSource::Network,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Response returned when even the offline document cannot be read
    pub fn offline_unavailable() -> Self {
        Self {
            status: 503,
            headers: vec![(
                "content-type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: b"offline".to_vec(),
            source: ResponseSource::Fallback,
        }
    }

    /// Whether the status is in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Cache key for a request: method + absolute URL
///
/// Only GET requests produce a key. Headers never participate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Key for a GET of `url`
    pub fn get(url: &Url) -> Self {
        Self {
            method: Method::GET.to_string(),
            url: url.to_string(),
        }
    }

    /// Derive the key for a request, or `None` if the method is not cacheable
    pub fn for_request(request: &Request) -> Option<Self> {
        if request.method == Method::GET {
            Some(Self::get(&request.url))
        } else {
            None
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A response as held in a cache namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
}

impl CachedResponse {
    /// Convert back into a response tagged with `source`
    pub fn into_response(self, source: ResponseSource) -> Response {
        Response {
            status: self.status,
            headers: self.headers,
            body: self.body,
            source,
        }
    }

    /// Partial content cannot be replayed for a full request
    pub fn is_storable(&self) -> bool {
        self.status != 206
    }
}

impl From<&Response> for CachedResponse {
    fn from(response: &Response) -> Self {
        Self {
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
        }
    }
}

/// Serde adapter storing bodies as base64 strings
pub mod body_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
