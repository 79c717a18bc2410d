//! Versioned cache store
//!
//! A store holds named namespaces (one per deployed version), each mapping a
//! request key to a cached response. Entries are never evicted one by one;
//! a namespace is dropped as a whole when a newer version takes over.

pub mod disk;
pub mod memory;

use async_trait::async_trait;

use crate::http::{CachedResponse, RequestKey};

pub use disk::DiskStore;
pub use memory::MemoryStore;

/// Any fault touching the cache store
#[derive(Debug, thiserror::Error)]
pub enum CacheIoError {
    #[error("Cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt cache entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache task failed: {0}")]
    Task(String),

    #[error("Response for {0} cannot be stored")]
    Unstorable(String),
}

/// Storage backend for cache namespaces
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Create the namespace if it does not exist yet
    async fn open(&self, namespace: &str) -> Result<(), CacheIoError>;

    /// Look up a key in a namespace
    async fn lookup(
        &self,
        namespace: &str,
        key: &RequestKey,
    ) -> Result<Option<CachedResponse>, CacheIoError>;

    /// Insert or overwrite an entry, creating the namespace if needed
    async fn put(
        &self,
        namespace: &str,
        key: &RequestKey,
        response: CachedResponse,
    ) -> Result<(), CacheIoError>;

    /// All keys held by a namespace (empty if it does not exist)
    async fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>, CacheIoError>;

    /// Names of every namespace in the store
    async fn namespaces(&self) -> Result<Vec<String>, CacheIoError>;

    /// Drop a namespace and everything in it. Returns whether it existed.
    async fn delete(&self, namespace: &str) -> Result<bool, CacheIoError>;
}

/// Reject entries that can never be replayed
pub(crate) fn check_storable(
    key: &RequestKey,
    response: &CachedResponse,
) -> Result<(), CacheIoError> {
    if response.is_storable() {
        Ok(())
    } else {
        Err(CacheIoError::Unstorable(key.to_string()))
    }
}
