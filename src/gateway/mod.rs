//! Cache Gateway
//!
//! One deployed cache version and the three hooks a host drives it through:
//! provisioning (`install`), takeover (`activate`) and per-request
//! interception (`handle_fetch`).

pub mod bootstrap;
pub mod interceptor;
pub mod lifecycle;
pub mod registration;
pub mod strategy;

use std::sync::Arc;

use tracing::{error, info};

use crate::config::GatewayConfig;
use crate::http::{Network, Request, RequestKey, Response};
use crate::store::CacheStore;

pub use bootstrap::{BootstrapError, Bootstrapper};
pub use interceptor::{classify, Route};
pub use lifecycle::{ClientId, ClientRegistry, Lifecycle, LifecycleError, PurgeReport, WorkerState};
pub use registration::{Registration, RegistrationStatus};
pub use strategy::StrategyEngine;

/// What the host should do with an intercepted request
#[derive(Debug)]
pub enum FetchOutcome {
    /// Send the (unmodified) request to the network yourself
    PassThrough(Request),
    /// Answer with this response
    Respond(Response),
}

/// Result of a successful activation
#[derive(Debug, Clone)]
pub struct ActivationReport {
    /// Sources that switched to this version
    pub claimed: usize,
    /// Namespace sweep outcome
    pub purge: PurgeReport,
}

/// One cache version
pub struct CacheGateway {
    config: GatewayConfig,
    store: Arc<dyn CacheStore>,
    lifecycle: Lifecycle,
    bootstrapper: Bootstrapper,
    strategy: StrategyEngine,
}

impl CacheGateway {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Network>,
    ) -> Self {
        let bootstrapper = Bootstrapper::new(
            config.version.clone(),
            config.shell.clone(),
            Arc::clone(&store),
            Arc::clone(&network),
        );
        let strategy = StrategyEngine::new(
            config.version.clone(),
            RequestKey::get(&config.offline_url),
            Arc::clone(&store),
            network,
        );

        Self {
            lifecycle: Lifecycle::new(config.version.clone()),
            config,
            store,
            bootstrapper,
            strategy,
        }
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    /// Provisioning hook: install the shell into this version's namespace
    ///
    /// On success the version is ready to activate right away; it does not
    /// wait for an older version to finish. On failure the state stays
    /// `Installing` so the whole install can be retried.
    pub async fn install(&self) -> Result<(), BootstrapError> {
        self.lifecycle.transition(
            &[WorkerState::Installing, WorkerState::Installed],
            WorkerState::Installing,
        )?;

        match self.bootstrapper.run().await {
            Ok(_) => {
                self.lifecycle
                    .transition(&[WorkerState::Installing], WorkerState::Installed)?;
                Ok(())
            }
            Err(e) => {
                error!(version = %self.config.version, error = %e, "Install failed");
                Err(e)
            }
        }
    }

    /// Takeover hook: claim every connected source and purge old namespaces
    pub async fn activate(
        &self,
        clients: &ClientRegistry,
    ) -> Result<ActivationReport, LifecycleError> {
        self.lifecycle
            .transition(&[WorkerState::Installed], WorkerState::Activating)?;

        let claimed = clients.claim(&self.config.version);

        self.lifecycle
            .transition(&[WorkerState::Activating], WorkerState::Activated)?;

        let purge =
            lifecycle::purge_stale_namespaces(self.store.as_ref(), &self.config.version).await;

        info!(
            version = %self.config.version,
            claimed = claimed,
            purged = purge.deleted.len(),
            purge_failures = purge.failed.len(),
            "Version active"
        );

        Ok(ActivationReport { claimed, purge })
    }

    /// Per-request hook
    pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
        if self.state() != WorkerState::Activated {
            return FetchOutcome::PassThrough(request);
        }

        match classify(&request) {
            Route::PassThrough => FetchOutcome::PassThrough(request),
            Route::Navigation => {
                FetchOutcome::Respond(self.strategy.navigation_fallback(&request).await)
            }
            Route::Resource => match RequestKey::for_request(&request) {
                Some(key) => {
                    FetchOutcome::Respond(self.strategy.stale_while_revalidate(key, request).await)
                }
                None => FetchOutcome::PassThrough(request),
            },
        }
    }

    /// Freeze the namespace: requests are still answered, nothing is written
    pub fn stop_writes(&self) {
        self.strategy.close();
    }

    /// Wait for cache writes that started before `stop_writes`
    pub async fn drain_writes(&self) {
        self.strategy.drain_writes().await;
    }

    /// Supersede this version; background tasks stop writing to its namespace
    pub fn retire(&self) {
        self.strategy.close();
        self.lifecycle.retire();
    }

    /// Wait for in-flight background cache writes
    pub async fn settle(&self) {
        self.strategy.settle().await;
    }

    /// Number of in-flight background cache writes
    pub fn pending_writes(&self) -> usize {
        self.strategy.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ResponseSource;
    use crate::store::MemoryStore;
    use crate::test_support::{app_url, serve_shell, test_config, ScriptedNetwork};
    use reqwest::Method;

    async fn active_gateway() -> (CacheGateway, Arc<MemoryStore>, Arc<ScriptedNetwork>) {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(ScriptedNetwork::new());
        serve_shell(&network);

        let gateway = CacheGateway::new(test_config("v1"), store.clone(), network.clone());
        gateway.install().await.unwrap();
        gateway.activate(&ClientRegistry::new()).await.unwrap();
        (gateway, store, network)
    }

    #[tokio::test]
    async fn test_not_active_passes_through() {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(ScriptedNetwork::new());
        serve_shell(&network);
        let gateway = CacheGateway::new(test_config("v1"), store, network.clone());

        let outcome = gateway.handle_fetch(Request::get(app_url("/app.js"))).await;
        assert!(matches!(outcome, FetchOutcome::PassThrough(_)));

        gateway.install().await.unwrap();
        assert_eq!(gateway.state(), WorkerState::Installed);
        let outcome = gateway.handle_fetch(Request::get(app_url("/app.js"))).await;
        assert!(matches!(outcome, FetchOutcome::PassThrough(_)));
    }

    #[tokio::test]
    async fn test_activate_requires_install() {
        let gateway = CacheGateway::new(
            test_config("v1"),
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedNetwork::new()),
        );
        assert!(gateway.activate(&ClientRegistry::new()).await.is_err());
        assert_eq!(gateway.state(), WorkerState::Installing);
    }

    #[tokio::test]
    async fn test_failed_install_can_be_retried() {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(ScriptedNetwork::new());
        let gateway = CacheGateway::new(test_config("v1"), store.clone(), network.clone());

        assert!(gateway.install().await.is_err());
        assert_eq!(gateway.state(), WorkerState::Installing);
        assert!(store.namespaces().await.unwrap().is_empty());

        serve_shell(&network);
        gateway.install().await.unwrap();
        assert_eq!(gateway.state(), WorkerState::Installed);
        assert_eq!(store.keys("v1").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_mutating_requests_bypass_cache() {
        let (gateway, store, network) = active_gateway().await;

        for method in [Method::POST, Method::PUT, Method::DELETE] {
            let request = Request::new(method, app_url("/api/bets")).with_body("{}");
            match gateway.handle_fetch(request).await {
                FetchOutcome::PassThrough(req) => assert_eq!(req.body.as_deref(), Some(&b"{}"[..])),
                FetchOutcome::Respond(_) => panic!("mutating request must not be answered"),
            }
        }

        gateway.settle().await;
        assert_eq!(network.call_count("/api/bets"), 0);
        assert_eq!(store.keys("v1").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_navigation_and_resource_routes() {
        let (gateway, _store, network) = active_gateway().await;
        network.respond(app_url("/").as_str(), 200, "live shell");
        network.respond(app_url("/styles.css").as_str(), 200, "body-v1");

        match gateway.handle_fetch(Request::navigate(app_url("/"))).await {
            FetchOutcome::Respond(r) => {
                assert_eq!(r.body, b"live shell");
                assert_eq!(r.source, ResponseSource::Network);
            }
            FetchOutcome::PassThrough(_) => panic!("navigation should be answered"),
        }

        match gateway.handle_fetch(Request::get(app_url("/styles.css"))).await {
            FetchOutcome::Respond(r) => assert_eq!(r.body, b"body-v1"),
            FetchOutcome::PassThrough(_) => panic!("resource should be answered"),
        }
    }

    #[tokio::test]
    async fn test_frozen_gateway_keeps_answering() {
        let (gateway, store, network) = active_gateway().await;
        network.respond(app_url("/styles.css").as_str(), 200, "body-v1");

        gateway.stop_writes();
        assert_eq!(gateway.state(), WorkerState::Activated);

        match gateway.handle_fetch(Request::get(app_url("/styles.css"))).await {
            FetchOutcome::Respond(r) => assert_eq!(r.body, b"body-v1"),
            FetchOutcome::PassThrough(_) => panic!("frozen version must still answer"),
        }
        gateway.settle().await;
        gateway.drain_writes().await;
        assert_eq!(store.keys("v1").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_retired_gateway_passes_through() {
        let (gateway, _store, _network) = active_gateway().await;
        gateway.retire();
        assert_eq!(gateway.state(), WorkerState::Redundant);

        let outcome = gateway.handle_fetch(Request::get(app_url("/styles.css"))).await;
        assert!(matches!(outcome, FetchOutcome::PassThrough(_)));
    }
}
