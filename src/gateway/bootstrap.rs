//! Install Bootstrapper
//!
//! Fetches the whole shell manifest, then writes it into the version's
//! namespace. Either every entry lands or a namespace this install created is
//! removed again. A namespace that was already there is never removed.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use super::lifecycle::LifecycleError;
use crate::http::{CachedResponse, Network, NetworkError, Request, RequestKey};
use crate::store::{CacheIoError, CacheStore};

/// Install failed; the whole install has to be retried
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Shell entry {url} could not be fetched: {source}")]
    Fetch { url: String, source: NetworkError },

    #[error("Failed to store shell in namespace {namespace}: {source}")]
    Store {
        namespace: String,
        source: CacheIoError,
    },

    #[error("Install task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Populates a namespace with the application shell
pub struct Bootstrapper {
    /// Namespace (version) to install into
    namespace: String,
    /// Shell manifest, in install order
    shell: Vec<Url>,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
}

impl Bootstrapper {
    pub fn new(
        namespace: impl Into<String>,
        shell: Vec<Url>,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Network>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            shell,
            store,
            network,
        }
    }

    /// Run the install. Returns the number of shell entries stored.
    pub async fn run(&self) -> Result<usize, BootstrapError> {
        info!(
            namespace = %self.namespace,
            entries = self.shell.len(),
            "Installing application shell"
        );

        let fetched = self.fetch_all().await?;
        let count = fetched.len();

        let existed = self
            .store
            .namespaces()
            .await
            .map_err(|source| BootstrapError::Store {
                namespace: self.namespace.clone(),
                source,
            })?
            .contains(&self.namespace);

        if let Err(e) = self.store_all(fetched).await {
            if existed {
                // Reinstalling over a live namespace: its entries stay usable
                warn!(
                    namespace = %self.namespace,
                    "Reinstall failed, keeping existing namespace"
                );
                return Err(e);
            }
            // A partially written shell must not be usable
            if let Err(cleanup) = self.store.delete(&self.namespace).await {
                warn!(
                    namespace = %self.namespace,
                    error = %cleanup,
                    "Failed to remove partially installed namespace"
                );
            }
            return Err(e);
        }

        info!(namespace = %self.namespace, entries = count, "Application shell installed");
        Ok(count)
    }

    /// Fetch every manifest entry concurrently; fail on the first miss
    async fn fetch_all(&self) -> Result<Vec<(RequestKey, CachedResponse)>, BootstrapError> {
        let mut tasks = JoinSet::new();

        for (index, url) in self.shell.iter().enumerate() {
            let network = Arc::clone(&self.network);
            let url = url.clone();
            tasks.spawn(async move {
                let result = match network.fetch(&Request::get(url.clone())).await {
                    Ok(response) if response.is_success() => Ok(response),
                    Ok(response) => Err(NetworkError::from_status(response.status, url.as_str())),
                    Err(e) => Err(e),
                };
                (index, url, result)
            });
        }

        let mut slots: Vec<Option<(RequestKey, CachedResponse)>> = vec![None; self.shell.len()];

        while let Some(joined) = tasks.join_next().await {
            let (index, url, result) = joined.map_err(|e| BootstrapError::Task(e.to_string()))?;
            match result {
                Ok(response) => {
                    debug!(url = %url, status = response.status, "Fetched shell entry");
                    slots[index] = Some((RequestKey::get(&url), CachedResponse::from(&response)));
                }
                Err(source) => {
                    tasks.abort_all();
                    warn!(url = %url, error = %source, "Shell entry unavailable, install aborted");
                    return Err(BootstrapError::Fetch {
                        url: url.to_string(),
                        source,
                    });
                }
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }

    async fn store_all(
        &self,
        entries: Vec<(RequestKey, CachedResponse)>,
    ) -> Result<(), BootstrapError> {
        let store_err = |source| BootstrapError::Store {
            namespace: self.namespace.clone(),
            source,
        };

        self.store.open(&self.namespace).await.map_err(store_err)?;
        for (key, response) in entries {
            self.store
                .put(&self.namespace, &key, response)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::{shell_urls, FaultyStore, ScriptedNetwork};

    fn serve_shell(network: &ScriptedNetwork) {
        for url in shell_urls() {
            network.respond(url.as_str(), 200, format!("shell:{}", url.path()));
        }
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(ScriptedNetwork::new());
        serve_shell(&network);

        let bootstrapper = Bootstrapper::new("v1", shell_urls(), store.clone(), network);
        assert_eq!(bootstrapper.run().await.unwrap(), 5);
        assert_eq!(bootstrapper.run().await.unwrap(), 5);

        let mut keys: Vec<String> = store
            .keys("v1")
            .await
            .unwrap()
            .into_iter()
            .map(|k| k.url)
            .collect();
        keys.sort();
        let mut expected: Vec<String> = shell_urls().iter().map(|u| u.to_string()).collect();
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn test_missing_entry_fails_without_namespace() {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(ScriptedNetwork::new());
        serve_shell(&network);
        network.respond("https://app.test/favicon.ico", 404, "not found");

        let bootstrapper = Bootstrapper::new("v1", shell_urls(), store.clone(), network);
        let err = bootstrapper.run().await.unwrap_err();

        match err {
            BootstrapError::Fetch { url, source } => {
                assert_eq!(url, "https://app.test/favicon.ico");
                assert!(matches!(source, NetworkError::NotFound(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.namespaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_origin_fails_install() {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(ScriptedNetwork::new());
        serve_shell(&network);
        network.set_offline(true);

        let bootstrapper = Bootstrapper::new("v1", shell_urls(), store.clone(), network);
        assert!(matches!(
            bootstrapper.run().await,
            Err(BootstrapError::Fetch { .. })
        ));
        assert!(store.namespaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_removes_partial_namespace() {
        let store = Arc::new(FaultyStore::new());
        let network = Arc::new(ScriptedNetwork::new());
        serve_shell(&network);
        store.fail_writes_after(2);

        let bootstrapper = Bootstrapper::new("v1", shell_urls(), store.clone(), network);
        let err = bootstrapper.run().await.unwrap_err();

        assert!(matches!(err, BootstrapError::Store { .. }));
        assert!(store.inner().namespaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_reinstall_keeps_existing_namespace() {
        let store = Arc::new(FaultyStore::new());
        let network = Arc::new(ScriptedNetwork::new());
        serve_shell(&network);

        let bootstrapper = Bootstrapper::new("v1", shell_urls(), store.clone(), network);
        bootstrapper.run().await.unwrap();

        store.fail_writes_after(2);
        let err = bootstrapper.run().await.unwrap_err();

        assert!(matches!(err, BootstrapError::Store { .. }));
        assert_eq!(store.inner().namespaces().await.unwrap(), vec!["v1".to_string()]);
        assert_eq!(store.inner().keys("v1").await.unwrap().len(), 5);
    }
}
