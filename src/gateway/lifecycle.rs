//! Lifecycle Manager
//!
//! Per-version state machine, the registry of connected request sources and
//! the namespace sweep that runs when a version takes over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::CacheStore;

/// Lifecycle state of one gateway version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerState {
    /// Shell is being fetched into the namespace
    Installing,
    /// Shell is complete; waiting to take control
    Installed,
    /// Claiming request sources
    Activating,
    /// Serving requests
    Activated,
    /// Superseded by a newer version (or abandoned)
    Redundant,
}

/// Illegal lifecycle transition
#[derive(Debug, Clone, thiserror::Error)]
pub enum LifecycleError {
    #[error("Cannot move version {version} from {from:?} to {to:?}")]
    InvalidTransition {
        version: String,
        from: WorkerState,
        to: WorkerState,
    },
}

/// State cell for one gateway version
pub struct Lifecycle {
    version: String,
    state: RwLock<WorkerState>,
}

impl Lifecycle {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            state: RwLock::new(WorkerState::Installing),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `to` if the current state is one of `from`
    ///
    /// Returns the state that was left.
    pub fn transition(
        &self,
        from: &[WorkerState],
        to: WorkerState,
    ) -> Result<WorkerState, LifecycleError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let current = *state;

        if !from.contains(&current) {
            return Err(LifecycleError::InvalidTransition {
                version: self.version.clone(),
                from: current,
                to,
            });
        }

        *state = to;
        if current != to {
            info!(version = %self.version, from = ?current, to = ?to, "Lifecycle transition");
        }
        Ok(current)
    }

    /// Mark this version redundant from any state
    pub fn retire(&self) -> WorkerState {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut *state, WorkerState::Redundant);
        if previous != WorkerState::Redundant {
            info!(version = %self.version, from = ?previous, "Version is now redundant");
        }
        previous
    }
}

/// Identifier of a connected request source
pub type ClientId = u64;

/// Connected request sources and the version controlling each
pub struct ClientRegistry {
    /// Controlling version by client (None = uncontrolled)
    clients: RwLock<HashMap<ClientId, Option<String>>>,
    /// Next client ID to assign
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a source, controlled by `controller` if a version is active
    pub fn connect(&self, controller: Option<String>) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(client = id, controller = ?controller, "Request source connected");
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, controller);
        id
    }

    /// Forget a source. Returns whether it was known.
    pub fn disconnect(&self, id: ClientId) -> bool {
        let removed = self
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            debug!(client = id, "Request source disconnected");
        }
        removed
    }

    /// Version controlling `id`, if any
    pub fn controller(&self, id: ClientId) -> Option<String> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .flatten()
    }

    /// Route every connected source through `version`
    ///
    /// Returns how many sources changed controller.
    pub fn claim(&self, version: &str) -> usize {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        let mut claimed = 0;
        for controller in clients.values_mut() {
            if controller.as_deref() != Some(version) {
                *controller = Some(version.to_string());
                claimed += 1;
            }
        }
        claimed
    }

    pub fn len(&self) -> usize {
        self.clients.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a namespace sweep
#[derive(Debug, Default, Clone)]
pub struct PurgeReport {
    /// Namespaces that were removed
    pub deleted: Vec<String>,
    /// Namespaces whose deletion failed
    pub failed: Vec<String>,
}

/// Delete every namespace other than `active`
///
/// Best-effort: each namespace is handled independently and failures are
/// only logged and counted.
pub async fn purge_stale_namespaces(store: &dyn CacheStore, active: &str) -> PurgeReport {
    let mut report = PurgeReport::default();

    let namespaces = match store.namespaces().await {
        Ok(namespaces) => namespaces,
        Err(e) => {
            warn!(active = active, error = %e, "Could not list cache namespaces, skipping purge");
            return report;
        }
    };

    for namespace in namespaces.into_iter().filter(|n| n != active) {
        match store.delete(&namespace).await {
            Ok(_) => {
                info!(namespace = %namespace, "Purged stale cache namespace");
                report.deleted.push(namespace);
            }
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "Failed to purge cache namespace");
                report.failed.push(namespace);
            }
        }
    }

    report
}
