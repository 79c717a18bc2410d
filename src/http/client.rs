//! Network transport
//!
//! The gateway talks to the origin through the [`Network`] trait. The
//! production implementation wraps a reqwest client with a bounded timeout
//! and keeps a small health record for status reporting.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use super::errors::NetworkError;
use super::types::{Request, Response, ResponseSource};

/// Default transport timeout; the only bound on a network race
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of recent errors to track
const MAX_ERROR_HISTORY: usize = 10;

/// Headers that describe the hop to us rather than the request itself
const HOP_BY_HOP: [&str; 5] = [
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
];

/// Health status values
pub const HEALTH_HEALTHY: u8 = 0;
pub const HEALTH_DEGRADED: u8 = 1;
pub const HEALTH_UNHEALTHY: u8 = 2;

/// A recent error entry for tracking
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub timestamp: u64,
    pub method: String,
    pub url: String,
    pub error: String,
}

/// Transport used for every request that reaches the network
#[async_trait]
pub trait Network: Send + Sync {
    /// Perform the request. Any response the origin returns, whatever its
    /// status, is `Ok`; `Err` means the request did not resolve.
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;

    /// Connection health as a short string
    fn health_status(&self) -> &'static str {
        "healthy"
    }

    /// Recent transport errors, oldest first
    fn recent_errors(&self) -> Vec<ErrorEntry> {
        Vec::new()
    }
}

/// reqwest-backed network transport
#[derive(Clone)]
pub struct HttpNetwork {
    /// HTTP client for making requests
    http_client: Client,
    /// Connection health (0=healthy, 1=degraded, 2=unhealthy)
    health: Arc<AtomicU8>,
    /// Recent error log
    error_log: Arc<RwLock<VecDeque<ErrorEntry>>>,
}

impl HttpNetwork {
    /// Create a transport with the default timeout
    pub fn new() -> Result<Self> {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    /// Create a transport whose requests give up after `timeout`
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        debug!(timeout_ms = timeout.as_millis() as u64, "HTTP transport ready");

        Ok(Self {
            http_client,
            health: Arc::new(AtomicU8::new(HEALTH_HEALTHY)),
            error_log: Arc::new(RwLock::new(VecDeque::with_capacity(MAX_ERROR_HISTORY))),
        })
    }

    async fn send(&self, request: &Request) -> Result<Response, NetworkError> {
        let mut builder = self
            .http_client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in &request.headers {
            if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response.bytes().await?;

        Ok(Response {
            status,
            headers,
            body: body.to_vec(),
            source: ResponseSource::Network,
        })
    }

    /// Log an error to the error history ring buffer
    fn log_error(&self, request: &Request, error: &NetworkError) {
        let entry = ErrorEntry {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            method: request.method.to_string(),
            url: request.url.to_string(),
            error: error.to_string(),
        };

        let mut log = self.error_log.write().unwrap_or_else(PoisonError::into_inner);
        if log.len() >= MAX_ERROR_HISTORY {
            log.pop_front();
        }
        log.push_back(entry);
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
        debug!(method = %request.method, url = %request.url, "Fetching from network");

        match self.send(request).await {
            Ok(response) => {
                self.health.store(HEALTH_HEALTHY, Ordering::Relaxed);
                debug!(
                    url = %request.url,
                    status = response.status,
                    size = response.body.len(),
                    "Network response"
                );
                Ok(response)
            }
            Err(e) => {
                let health = match e {
                    NetworkError::Connect(_) => HEALTH_UNHEALTHY,
                    _ => HEALTH_DEGRADED,
                };
                self.health.store(health, Ordering::Relaxed);
                self.log_error(request, &e);
                warn!(method = %request.method, url = %request.url, error = %e, "Network request failed");
                Err(e)
            }
        }
    }

    fn health_status(&self) -> &'static str {
        match self.health.load(Ordering::Relaxed) {
            HEALTH_HEALTHY => "healthy",
            HEALTH_DEGRADED => "degraded",
            _ => "unhealthy",
        }
    }

    fn recent_errors(&self) -> Vec<ErrorEntry> {
        self.error_log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
