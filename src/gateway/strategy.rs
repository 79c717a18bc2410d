//! Strategy Engine
//!
//! Navigation-fallback and stale-while-revalidate over one cache namespace.
//! Cache faults are logged and treated as misses; network faults are replaced
//! by the offline document. Neither ever reaches the caller.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};

use crate::http::{
    CachedResponse, Network, NetworkError, Request, RequestKey, Response, ResponseSource,
};
use crate::store::CacheStore;

#[derive(Default)]
struct BackgroundInner {
    pending: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
    /// Tasks between the closed check and the end of their store write
    writing: AtomicUsize,
    writes_idle: Notify,
}

/// Detached tasks that outlive the request that started them
///
/// Tasks run on the runtime, not under the caller, so dropping the caller
/// never cancels them. The counter lets the host wait for them on shutdown.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    inner: Arc<BackgroundInner>,
}

struct PendingGuard(Arc<BackgroundInner>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Permission to write into the namespace, held for the whole write
pub struct WriteGuard(Arc<BackgroundInner>);

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if self.0.writing.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.writes_idle.notify_waiters();
        }
    }
}

impl BackgroundTasks {
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let guard = PendingGuard(Arc::clone(&self.inner));
        tokio::spawn(async move {
            let _guard = guard;
            task.await;
        });
    }

    /// Number of tasks still running
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Stop accepting cache writes from tasks that have not written yet
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Claim a store write, or `None` once closed
    ///
    /// The writer is counted before the closed flag is read, so a write that
    /// gets a guard is always seen by a `drain_writes` that follows `close`.
    pub fn begin_write(&self) -> Option<WriteGuard> {
        self.inner.writing.fetch_add(1, Ordering::SeqCst);
        let guard = WriteGuard(Arc::clone(&self.inner));
        if self.is_closed() {
            return None;
        }
        Some(guard)
    }

    /// Number of store writes in progress
    fn writing(&self) -> usize {
        self.inner.writing.load(Ordering::SeqCst)
    }

    /// Wait until no task is running
    pub async fn settle(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.idle.notified());
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait until no store write is in progress
    ///
    /// Tasks still waiting on the network are not waited for; after `close`
    /// they can no longer write.
    pub async fn drain_writes(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.writes_idle.notified());
            notified.as_mut().enable();
            if self.writing() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Caching policies bound to one namespace
pub struct StrategyEngine {
    /// Active namespace for this version
    namespace: String,
    /// Key of the offline-fallback document
    offline_key: RequestKey,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    background: BackgroundTasks,
}

impl StrategyEngine {
    pub fn new(
        namespace: impl Into<String>,
        offline_key: RequestKey,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Network>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            offline_key,
            store,
            network,
            background: BackgroundTasks::default(),
        }
    }

    /// Network first; the offline document if the network fails
    ///
    /// Never writes to the cache.
    pub async fn navigation_fallback(&self, request: &Request) -> Response {
        match self.network.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %request.url, error = %e, "Navigation failed, serving offline document");
                self.offline_fallback().await
            }
        }
    }

    /// Serve a cached entry immediately and refresh it in the background
    ///
    /// On a miss the network result is awaited, returned and stored; if the
    /// network fails too the offline document is returned.
    pub async fn stale_while_revalidate(&self, key: RequestKey, request: Request) -> Response {
        let url = request.url.clone();
        let (tx, rx) = oneshot::channel();
        self.revalidate(key.clone(), request, tx);

        if let Some(cached) = self.lookup(&key).await {
            debug!(url = %url, "Cache HIT, revalidating in background");
            return cached.into_response(ResponseSource::Cache);
        }

        debug!(url = %url, "Cache MISS, waiting for network");
        match rx.await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) | Err(_) => self.offline_fallback().await,
        }
    }

    /// Start the network fetch for `key` as a background task
    ///
    /// The task hands the response to whoever is still listening on `tx`,
    /// then stores it.
    fn revalidate(
        &self,
        key: RequestKey,
        request: Request,
        tx: oneshot::Sender<Result<Response, NetworkError>>,
    ) {
        let store = Arc::clone(&self.store);
        let network = Arc::clone(&self.network);
        let namespace = self.namespace.clone();
        let background = self.background.clone();

        self.background.spawn(async move {
            let response = match network.fetch(&request).await {
                Ok(response) => response,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };

            let cached = CachedResponse::from(&response);
            let _ = tx.send(Ok(response));

            let Some(_write) = background.begin_write() else {
                trace!(key = %key, "Namespace retired, dropping revalidated entry");
                return;
            };

            match store.put(&namespace, &key, cached).await {
                Ok(()) => trace!(namespace = %namespace, key = %key, "Cache updated"),
                Err(e) => warn!(key = %key, error = %e, "Cache write failed, ignoring"),
            }
        });
    }

    /// Offline document from the cache, or a synthetic 503 if even that fails
    async fn offline_fallback(&self) -> Response {
        match self.lookup(&self.offline_key).await {
            Some(cached) => cached.into_response(ResponseSource::Fallback),
            None => {
                warn!(key = %self.offline_key, "Offline document missing from cache");
                Response::offline_unavailable()
            }
        }
    }

    /// Cache lookup where any fault is a miss
    async fn lookup(&self, key: &RequestKey) -> Option<CachedResponse> {
        match self.store.lookup(&self.namespace, key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
                None
            }
        }
    }

    /// Stop background tasks from writing into this namespace
    pub fn close(&self) {
        self.background.close();
    }

    /// Wait for in-flight revalidations to finish
    pub async fn settle(&self) {
        self.background.settle().await;
    }

    /// Wait for store writes already under way
    pub async fn drain_writes(&self) {
        self.background.drain_writes().await;
    }

    /// Number of in-flight revalidations
    pub fn pending(&self) -> usize {
        self.background.pending()
    }
}
