//! On-disk cache store
//!
//! Each namespace is a directory under the store root, named by the
//! URL-encoded version string. Each entry is one JSON file named by the SHA-1
//! of its key, written atomically through a temp file in the same directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tracing::{debug, info, trace, warn};

use super::{check_storable, CacheIoError, CacheStore};
use crate::http::{CachedResponse, RequestKey};

/// Extension of completed entry files
const ENTRY_EXT: &str = "json";

/// Suffix of in-progress writes
const TMP_SUFFIX: &str = ".tmp";

/// Entry file contents: the key is stored alongside the response so a
/// namespace can be listed without a separate index.
#[derive(serde::Serialize, serde::Deserialize)]
struct StoredEntry {
    key: RequestKey,
    response: CachedResponse,
}

/// Directory-backed store
#[derive(Clone)]
pub struct DiskStore {
    /// Root directory holding one subdirectory per namespace
    root: Arc<PathBuf>,
}

impl DiskStore {
    /// Open the store in the platform cache directory
    pub fn new() -> Result<Self, CacheIoError> {
        Self::with_root(default_root())
    }

    /// Open the store rooted at `root`, creating it if needed
    pub fn with_root(root: PathBuf) -> Result<Self, CacheIoError> {
        fs::create_dir_all(&root)?;

        let store = Self {
            root: Arc::new(root),
        };

        // Clean up any stale temp files from previous runs
        store.cleanup();

        info!(root = %store.root.display(), "Disk cache store initialized");
        Ok(store)
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Remove `*.tmp` files left by interrupted writes
    pub fn cleanup(&self) {
        let Ok(namespaces) = fs::read_dir(self.root.as_path()) else {
            return;
        };

        for dir in namespaces.flatten() {
            let Ok(entries) = fs::read_dir(dir.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let is_tmp = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(TMP_SUFFIX));
                if is_tmp {
                    debug!(path = %path.display(), "Removing stale temp file");
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(urlencoding::encode(namespace).as_ref())
    }

    fn entry_path(&self, namespace: &str, key: &RequestKey) -> PathBuf {
        let mut hasher = Sha1::new();
        hasher.update(key.method.as_bytes());
        hasher.update(b" ");
        hasher.update(key.url.as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        self.namespace_dir(namespace)
            .join(format!("{}.{}", hash, ENTRY_EXT))
    }

    /// Run blocking filesystem work off the async worker threads
    async fn blocking<T, F>(&self, f: F) -> Result<T, CacheIoError>
    where
        T: Send + 'static,
        F: FnOnce(DiskStore) -> Result<T, CacheIoError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| CacheIoError::Task(e.to_string()))?
    }

    fn read_entry(path: &Path) -> Result<Option<StoredEntry>, CacheIoError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_entry(&self, namespace: &str, entry: &StoredEntry) -> Result<(), CacheIoError> {
        let dir = self.namespace_dir(namespace);
        fs::create_dir_all(&dir)?;

        let path = self.entry_path(namespace, &entry.key);
        let json = serde_json::to_vec(entry)?;

        let mut tmp = tempfile::Builder::new()
            .suffix(TMP_SUFFIX)
            .tempfile_in(&dir)?;
        tmp.write_all(&json)?;
        tmp.persist(&path).map_err(|e| CacheIoError::Io(e.error))?;

        trace!(
            namespace = namespace,
            key = %entry.key,
            size = json.len(),
            "Stored entry on disk"
        );
        Ok(())
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn open(&self, namespace: &str) -> Result<(), CacheIoError> {
        let namespace = namespace.to_string();
        self.blocking(move |store| {
            fs::create_dir_all(store.namespace_dir(&namespace))?;
            Ok(())
        })
        .await
    }

    async fn lookup(
        &self,
        namespace: &str,
        key: &RequestKey,
    ) -> Result<Option<CachedResponse>, CacheIoError> {
        let path = self.entry_path(namespace, key);
        let expected = key.clone();
        self.blocking(move |_| {
            let entry = DiskStore::read_entry(&path)?;
            // A hash collision would surface as a different stored key
            Ok(entry
                .filter(|e| e.key == expected)
                .map(|e| e.response))
        })
        .await
    }

    async fn put(
        &self,
        namespace: &str,
        key: &RequestKey,
        response: CachedResponse,
    ) -> Result<(), CacheIoError> {
        check_storable(key, &response)?;
        let namespace = namespace.to_string();
        let entry = StoredEntry {
            key: key.clone(),
            response,
        };
        self.blocking(move |store| store.write_entry(&namespace, &entry))
            .await
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>, CacheIoError> {
        let dir = self.namespace_dir(namespace);
        self.blocking(move |_| {
            let read_dir = match fs::read_dir(&dir) {
                Ok(read_dir) => read_dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };

            let mut keys = Vec::new();
            for entry in read_dir.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                    continue;
                }
                match DiskStore::read_entry(&path) {
                    Ok(Some(stored)) => keys.push(stored.key),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable cache entry");
                    }
                }
            }
            Ok(keys)
        })
        .await
    }

    async fn namespaces(&self) -> Result<Vec<String>, CacheIoError> {
        self.blocking(|store| {
            let mut names = Vec::new();
            for entry in fs::read_dir(store.root.as_path())?.flatten() {
                if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let raw = entry.file_name();
                let Some(raw) = raw.to_str() else {
                    continue;
                };
                match urlencoding::decode(raw) {
                    Ok(name) => names.push(name.into_owned()),
                    Err(_) => names.push(raw.to_string()),
                }
            }
            Ok(names)
        })
        .await
    }

    async fn delete(&self, namespace: &str) -> Result<bool, CacheIoError> {
        let dir = self.namespace_dir(namespace);
        let name = namespace.to_string();
        self.blocking(move |_| match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(namespace = %name, "Deleted cache namespace directory");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }
}

/// Default store root: `<platform cache dir>/shellcache`
pub fn default_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("shellcache")
}
