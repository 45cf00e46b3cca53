//! Install, activate and client takeover.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bridgenotary_net::{Fetcher, Request};
use bridgenotary_store::CacheStorage;
use futures::future::join_all;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::partition::{CacheRole, PartitionSet};
use crate::strategy::{cache_key, entry_from_response};
use crate::{SwError, WorkerEvent};

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Created, not yet installed.
    #[default]
    Parsed,
    /// Pre-caching the shell.
    Installing,
    /// Installed, waiting to activate.
    Installed,
    /// Collecting stale partitions.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install failed.
    Redundant,
}

/// Result of an install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    /// Manifest paths now in the static partition.
    pub cached: Vec<String>,
    /// Manifest paths that could not be fetched or stored.
    pub failed: Vec<String>,
    /// The worker asks to be activated without waiting.
    pub skip_waiting: bool,
}

/// Result of an activation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivateReport {
    /// Stale partitions removed.
    pub deleted: Vec<String>,
    /// Clients taken over.
    pub claimed: usize,
}

/// A page the worker may control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: String,
    pub url: Url,
    pub controlled: bool,
}

/// Open pages, and which of them this worker controls.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
    claimed: bool,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a page. Once clients have been claimed, new pages are
    /// controlled from the start.
    pub fn add(&mut self, id: &str, url: Url) {
        let client = Client {
            id: id.to_string(),
            url,
            controlled: self.claimed,
        };
        self.clients.insert(client.id.clone(), client);
    }

    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Take control of every tracked page. Returns how many changed hands.
    pub fn claim(&mut self) -> usize {
        self.claimed = true;
        self.clients
            .values_mut()
            .filter(|client| !client.controlled)
            .map(|client| client.controlled = true)
            .count()
    }
}

/// Drives the worker through install and activate.
pub struct Lifecycle {
    state: RwLock<(WorkerState, Instant)>,
    controlling: AtomicBool,
    origin: Url,
    precache: Vec<String>,
    partitions: Arc<PartitionSet>,
    caches: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    clients: RwLock<Clients>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl Lifecycle {
    pub fn new(
        origin: Url,
        precache: Vec<String>,
        partitions: Arc<PartitionSet>,
        caches: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        event_tx: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            state: RwLock::new((WorkerState::Parsed, Instant::now())),
            controlling: AtomicBool::new(false),
            origin,
            precache,
            partitions,
            caches,
            fetcher,
            clients: RwLock::new(Clients::new()),
            event_tx,
        }
    }

    pub async fn state(&self) -> WorkerState {
        self.state.read().await.0
    }

    /// Whether the worker has been activated and serves fetches. Stays set
    /// while a newer version installs, until that version activates.
    pub fn is_controlling(&self) -> bool {
        self.controlling.load(Ordering::Acquire)
    }

    /// Pre-cache the shell into the static partition.
    ///
    /// Individual files that fail are reported, never fatal. Only a failure
    /// to open the partition itself fails the install.
    pub async fn install(&self) -> Result<InstallReport, SwError> {
        let current = self.state().await;
        if !matches!(
            current,
            WorkerState::Parsed | WorkerState::Installed | WorkerState::Activated
        ) {
            return Err(SwError::StateError(format!("cannot install from {current:?}")));
        }
        self.set_state(WorkerState::Installing).await;

        let partition = self.partitions.get(CacheRole::Static);
        if let Err(e) = self.caches.open(&partition.name).await {
            warn!(partition = %partition.name, error = %e, "Failed to open static partition");
            self.set_state(WorkerState::Redundant).await;
            return Err(e.into());
        }

        let mut report = InstallReport {
            skip_waiting: true,
            ..Default::default()
        };
        for path in &self.precache {
            match self.precache_one(&partition.name, path).await {
                Ok(()) => report.cached.push(path.clone()),
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to cache static file");
                    report.failed.push(path.clone());
                }
            }
        }

        info!(
            cached = report.cached.len(),
            failed = report.failed.len(),
            "Install complete"
        );
        self.set_state(WorkerState::Installed).await;
        Ok(report)
    }

    async fn precache_one(&self, partition: &str, path: &str) -> Result<(), SwError> {
        let url = self
            .origin
            .join(path)
            .map_err(|e| SwError::InvalidUrl(format!("{path}: {e}")))?;
        let request = Request::get(url);
        let key = cache_key(&request);

        let response = self.fetcher.fetch(request).await?;
        if !response.ok() {
            return Err(SwError::StateError(format!("HTTP {}", response.status)));
        }
        self.caches
            .put(partition, entry_from_response(key, &response))
            .await?;
        Ok(())
    }

    /// Delete stale partitions, then claim open pages.
    ///
    /// A failure to list or delete partitions is logged; activation still
    /// completes.
    pub async fn activate(&self) -> Result<ActivateReport, SwError> {
        let current = self.state().await;
        if current != WorkerState::Installed {
            return Err(SwError::StateError(format!("cannot activate from {current:?}")));
        }
        self.set_state(WorkerState::Activating).await;

        let deleted = self.delete_stale_partitions().await;
        if !deleted.is_empty() {
            let _ = self.event_tx.send(WorkerEvent::CachesCleaned {
                deleted: deleted.clone(),
            });
        }

        self.set_state(WorkerState::Activated).await;
        self.controlling.store(true, Ordering::Release);

        let claimed = self.clients.write().await.claim();
        let _ = self.event_tx.send(WorkerEvent::ControllerChange { claimed });
        info!(deleted = deleted.len(), claimed, "Activated");

        Ok(ActivateReport { deleted, claimed })
    }

    async fn delete_stale_partitions(&self) -> Vec<String> {
        let names = match self.caches.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Failed to list cache partitions");
                return Vec::new();
            }
        };

        let stale: Vec<String> = names
            .into_iter()
            .filter(|name| self.partitions.is_stale(name))
            .collect();

        let results = join_all(stale.iter().map(|name| self.caches.delete(name))).await;

        stale
            .into_iter()
            .zip(results)
            .filter_map(|(name, result)| match result {
                Ok(_) => {
                    debug!(partition = %name, "Deleted stale partition");
                    Some(name)
                }
                Err(e) => {
                    warn!(partition = %name, error = %e, "Failed to delete stale partition");
                    None
                }
            })
            .collect()
    }

    /// Track an open page.
    pub async fn add_client(&self, id: &str, url: Url) {
        self.clients.write().await.add(id, url);
    }

    pub async fn is_controlled(&self, id: &str) -> bool {
        self.clients
            .read()
            .await
            .get(id)
            .is_some_and(|client| client.controlled)
    }

    async fn set_state(&self, state: WorkerState) {
        let previous = std::mem::replace(&mut *self.state.write().await, (state, Instant::now()));
        debug!(?state, from = ?previous.0, after = ?previous.1.elapsed(), "Worker state changed");
        let _ = self.event_tx.send(WorkerEvent::StateChange { state });
    }
}
