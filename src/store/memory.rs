//! In-memory cache store
//!
//! One unbounded Moka cache per namespace. Nothing expires or gets evicted on
//! its own; namespaces are dropped wholesale by the lifecycle manager.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use moka::sync::Cache;
use tracing::{debug, trace};

use super::{check_storable, CacheIoError, CacheStore};
use crate::http::{CachedResponse, RequestKey};

/// Namespaced in-memory store
#[derive(Default)]
pub struct MemoryStore {
    /// Namespaces by version name
    namespaces: RwLock<HashMap<String, Cache<RequestKey, CachedResponse>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn namespace(&self, name: &str) -> Option<Cache<RequestKey, CachedResponse>> {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn open_namespace(&self, name: &str) -> Cache<RequestKey, CachedResponse> {
        if let Some(cache) = self.namespace(name) {
            return cache;
        }

        let mut namespaces = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        namespaces
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(namespace = name, "Created cache namespace");
                Cache::builder().name(name).build()
            })
            .clone()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn open(&self, namespace: &str) -> Result<(), CacheIoError> {
        self.open_namespace(namespace);
        Ok(())
    }

    async fn lookup(
        &self,
        namespace: &str,
        key: &RequestKey,
    ) -> Result<Option<CachedResponse>, CacheIoError> {
        let hit = self.namespace(namespace).and_then(|cache| cache.get(key));
        trace!(namespace = namespace, key = %key, hit = hit.is_some(), "Memory store lookup");
        Ok(hit)
    }

    async fn put(
        &self,
        namespace: &str,
        key: &RequestKey,
        response: CachedResponse,
    ) -> Result<(), CacheIoError> {
        check_storable(key, &response)?;
        self.open_namespace(namespace).insert(key.clone(), response);
        trace!(namespace = namespace, key = %key, "Memory store put");
        Ok(())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>, CacheIoError> {
        Ok(self
            .namespace(namespace)
            .map(|cache| cache.iter().map(|(k, _)| (*k).clone()).collect())
            .unwrap_or_default())
    }

    async fn namespaces(&self) -> Result<Vec<String>, CacheIoError> {
        Ok(self
            .namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }

    async fn delete(&self, namespace: &str) -> Result<bool, CacheIoError> {
        let removed = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(namespace);

        match removed {
            Some(cache) => {
                cache.invalidate_all();
                debug!(namespace = namespace, "Deleted cache namespace");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> RequestKey {
        RequestKey {
            method: "GET".into(),
            url: format!("https://app.test{}", path),
        }
    }

    fn body(text: &str) -> CachedResponse {
        CachedResponse {
            status: 200,
            headers: vec![],
            body: text.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_put_lookup_overwrite() {
        let store = MemoryStore::new();

        assert!(store.lookup("v1", &key("/a.css")).await.unwrap().is_none());

        store.put("v1", &key("/a.css"), body("one")).await.unwrap();
        store.put("v1", &key("/a.css"), body("two")).await.unwrap();

        let hit = store.lookup("v1", &key("/a.css")).await.unwrap().unwrap();
        assert_eq!(hit.body, b"two");
        assert_eq!(store.keys("v1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = MemoryStore::new();
        store.put("v1", &key("/a.css"), body("old")).await.unwrap();
        store.open("v2").await.unwrap();

        assert!(store.lookup("v2", &key("/a.css")).await.unwrap().is_none());

        let mut names = store.namespaces().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["v1".to_string(), "v2".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_namespace() {
        let store = MemoryStore::new();
        store.put("v1", &key("/a.css"), body("old")).await.unwrap();

        assert!(store.delete("v1").await.unwrap());
        assert!(!store.delete("v1").await.unwrap());
        assert!(store.lookup("v1", &key("/a.css")).await.unwrap().is_none());
        assert!(store.namespaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_partial_content() {
        let store = MemoryStore::new();
        let partial = CachedResponse {
            status: 206,
            headers: vec![],
            body: b"par".to_vec(),
        };
        let err = store.put("v1", &key("/video.mp4"), partial).await.unwrap_err();
        assert!(matches!(err, CacheIoError::Unstorable(_)));
        assert!(store.keys("v1").await.unwrap().is_empty());
    }
}
