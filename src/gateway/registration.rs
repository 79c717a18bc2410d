//! Registration - owns the active version
//!
//! Deploys new gateway versions, supersedes the old one, and routes requests
//! from connected sources to whichever version controls them.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{BootstrapError, CacheGateway, ClientId, ClientRegistry, FetchOutcome, WorkerState};
use crate::config::{GatewayConfig, DEFAULT_INSTALL_ATTEMPTS, RETIRE_GRACE};
use crate::http::{ErrorEntry, Network, NetworkError, Request, Response};
use crate::store::CacheStore;

/// Backoff between whole-install attempts
const INSTALL_BACKOFF_MS: [u64; 3] = [500, 1000, 2000];

/// Snapshot for status reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationStatus {
    pub active_version: Option<String>,
    pub state: Option<WorkerState>,
    pub namespaces: Vec<String>,
    pub clients: usize,
    pub pending_writes: usize,
    pub network_health: String,
    #[serde(skip)]
    pub recent_errors: Vec<ErrorEntry>,
}

/// Host-side owner of the active gateway version
pub struct Registration {
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    clients: ClientRegistry,
    /// The single active version
    active: Arc<RwLock<Option<Arc<CacheGateway>>>>,
    /// Serializes deployments
    deploy_lock: Arc<Mutex<()>>,
    install_attempts: u32,
    retire_grace: Duration,
}

impl Registration {
    pub fn new(store: Arc<dyn CacheStore>, network: Arc<dyn Network>) -> Self {
        Self {
            store,
            network,
            clients: ClientRegistry::new(),
            active: Arc::new(RwLock::new(None)),
            deploy_lock: Arc::new(Mutex::new(())),
            install_attempts: DEFAULT_INSTALL_ATTEMPTS,
            retire_grace: RETIRE_GRACE,
        }
    }

    /// Set how many whole-install attempts a deploy makes
    pub fn with_install_attempts(mut self, attempts: u32) -> Self {
        self.install_attempts = attempts.max(1);
        self
    }

    /// Set how long cutover waits for the old version's cache writes
    pub fn with_retire_grace(mut self, grace: Duration) -> Self {
        self.retire_grace = grace;
        self
    }

    /// Currently active gateway, if any
    pub async fn active(&self) -> Option<Arc<CacheGateway>> {
        self.active.read().await.clone()
    }

    /// Version that currently controls requests
    pub async fn active_version(&self) -> Option<String> {
        self.active().await.map(|g| g.version().to_string())
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Install and activate a new version
    ///
    /// If the install fails after every attempt, the previously active
    /// version stays in control and nothing else changes. Otherwise the old
    /// version keeps answering, read-only, until the new one is swapped in.
    pub async fn deploy(&self, config: GatewayConfig) -> Result<Arc<CacheGateway>, BootstrapError> {
        let _guard = self.deploy_lock.lock().await;

        let version = config.version.clone();
        let gateway = Arc::new(CacheGateway::new(
            config,
            Arc::clone(&self.store),
            Arc::clone(&self.network),
        ));

        if let Err(e) = self.install_with_retry(&gateway).await {
            gateway.retire();
            return Err(e);
        }

        // Skip waiting: the old version is superseded as soon as the new
        // shell is in place.
        let previous = self.active().await;
        if let Some(previous) = &previous {
            previous.stop_writes();
            if tokio::time::timeout(self.retire_grace, previous.drain_writes())
                .await
                .is_err()
            {
                warn!(
                    version = %previous.version(),
                    pending = previous.pending_writes(),
                    "Superseded version still writing, sweeping its namespace later"
                );
                self.sweep_after_drain(Arc::clone(previous));
            }
        }

        // Readers wait here, so no request sees the new controller while the
        // old version is still installed as active.
        let report = {
            let mut active = self.active.write().await;
            let report = gateway.activate(&self.clients).await?;
            *active = Some(Arc::clone(&gateway));
            report
        };

        if let Some(previous) = &previous {
            previous.retire();
        }

        info!(
            version = %version,
            previous = ?previous.as_ref().map(|p| p.version().to_string()),
            claimed = report.claimed,
            "Deployed cache version"
        );
        Ok(gateway)
    }

    /// Remove a superseded namespace once its last write has landed
    ///
    /// Runs only when cutover stopped waiting for those writes, since a
    /// late write recreates the namespace the activation purge removed.
    fn sweep_after_drain(&self, previous: Arc<CacheGateway>) {
        let store = Arc::clone(&self.store);
        let active = Arc::clone(&self.active);
        let deploy_lock = Arc::clone(&self.deploy_lock);

        tokio::spawn(async move {
            previous.drain_writes().await;

            let _guard = deploy_lock.lock().await;
            let current = active.read().await.as_ref().map(|g| g.version().to_string());
            if current.as_deref() == Some(previous.version()) {
                return;
            }

            match store.delete(previous.version()).await {
                Ok(true) => info!(
                    namespace = %previous.version(),
                    "Removed namespace left by a late write"
                ),
                Ok(false) => {}
                Err(e) => warn!(
                    namespace = %previous.version(),
                    error = %e,
                    "Failed to remove superseded namespace"
                ),
            }
        });
    }

    async fn install_with_retry(&self, gateway: &CacheGateway) -> Result<(), BootstrapError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match gateway.install().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.install_attempts => return Err(e),
                Err(BootstrapError::Lifecycle(e)) => return Err(BootstrapError::Lifecycle(e)),
                Err(e) => {
                    let delay = INSTALL_BACKOFF_MS
                        .get(attempt as usize - 1)
                        .copied()
                        .unwrap_or(2000);
                    warn!(
                        version = %gateway.version(),
                        attempt = attempt,
                        max = self.install_attempts,
                        delay_ms = delay,
                        error = %e,
                        "Retrying install"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    /// Register a request source
    ///
    /// Sources that connect while a version is active are controlled by it
    /// from the start.
    pub async fn connect(&self) -> ClientId {
        let controller = self.active_version().await;
        self.clients.connect(controller)
    }

    pub fn disconnect(&self, client: ClientId) {
        self.clients.disconnect(client);
    }

    /// Route a request from `client`
    ///
    /// Controlled sources always go to the active version; a claim hands
    /// every connected source to the new version as it is swapped in.
    pub async fn fetch(&self, client: ClientId, request: Request) -> FetchOutcome {
        if self.clients.controller(client).is_none() {
            debug!(client = client, url = %request.url, "Uncontrolled source, passing through");
            return FetchOutcome::PassThrough(request);
        }

        match self.active().await {
            Some(gateway) => gateway.handle_fetch(request).await,
            None => FetchOutcome::PassThrough(request),
        }
    }

    /// Route a request and perform any pass-through on the network
    ///
    /// Errors only come from pass-through requests; intercepted requests
    /// always resolve.
    pub async fn respond(&self, client: ClientId, request: Request) -> Result<Response, NetworkError> {
        match self.fetch(client, request).await {
            FetchOutcome::Respond(response) => Ok(response),
            FetchOutcome::PassThrough(request) => self.network.fetch(&request).await,
        }
    }

    /// Wait for the active version's background writes
    pub async fn settle(&self) {
        if let Some(gateway) = self.active().await {
            gateway.settle().await;
        }
    }

    pub async fn status(&self) -> RegistrationStatus {
        let active = self.active().await;
        let namespaces = match self.store.namespaces().await {
            Ok(mut namespaces) => {
                namespaces.sort();
                namespaces
            }
            Err(e) => {
                warn!(error = %e, "Could not list cache namespaces");
                Vec::new()
            }
        };

        RegistrationStatus {
            active_version: active.as_ref().map(|g| g.version().to_string()),
            state: active.as_ref().map(|g| g.state()),
            namespaces,
            clients: self.clients.len(),
            pending_writes: active.as_ref().map(|g| g.pending_writes()).unwrap_or(0),
            network_health: self.network.health_status().to_string(),
            recent_errors: self.network.recent_errors(),
        }
    }
}
