//! # Bridge Notary Offline Worker
//!
//! Request interception, caching and form sync for the Bridge Notary site.
//!
//! ## Features
//!
//! - **Routing**: same-origin requests split into API, static and document traffic
//! - **Strategies**: network-first and cache-first over versioned partitions
//! - **Lifecycle**: install pre-cache, activate cleanup, client claim
//! - **Sync**: replay of queued form submissions on the `sync-forms` tag
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorker
//!     ├── Router ──► Strategies ──► Fetcher / CacheStorage
//!     ├── Lifecycle (install, activate, clients)
//!     ├── SyncTrigger ──► QueueStore ──► relay
//!     └── FormSubmitter ──► relay, or QueueStore when offline
//! ```

use std::sync::Arc;

use bridgenotary_core::{BridgeError, WorkerConfig};
use bridgenotary_net::{Fetcher, NetError, Request, Response};
use bridgenotary_store::{CacheStorage, Payload, PendingSubmission, QueueStore, StoreError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

pub mod lifecycle;
pub mod partition;
pub mod router;
pub mod strategy;
pub mod submit;
pub mod sync;

pub use lifecycle::{ActivateReport, Client, Clients, InstallReport, Lifecycle, WorkerState};
pub use partition::{CacheRole, ExpirationPolicy, Partition, PartitionSet};
pub use router::{Route, Router};
pub use strategy::{offline_response, Strategies, OFFLINE_BODY};
pub use submit::{FormSubmitter, RelayResponse, SubmissionOutcome};
pub use sync::{SyncReport, SyncTrigger};

// ==================== Errors ====================

/// Errors that can occur in worker operations.
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] BridgeError),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

// ==================== Events ====================

/// Events emitted by the worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// State changed.
    StateChange { state: WorkerState },
    /// Stale partitions were removed during activation.
    CachesCleaned { deleted: Vec<String> },
    /// The worker took control of open pages.
    ControllerChange { claimed: usize },
    /// A sync drain finished.
    SyncCompleted(SyncReport),
}

// ==================== Worker ====================

/// Storage and transport backends the worker runs on.
#[derive(Clone)]
pub struct WorkerHandles {
    pub fetcher: Arc<dyn Fetcher>,
    pub caches: Arc<dyn CacheStorage>,
    pub queue: Arc<dyn QueueStore>,
}

/// The offline worker.
pub struct ServiceWorker {
    router: Router,
    partitions: Arc<PartitionSet>,
    strategies: Strategies,
    lifecycle: Lifecycle,
    sync: SyncTrigger,
    submitter: FormSubmitter,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl ServiceWorker {
    /// Build a worker from configuration. Events are delivered on the
    /// returned receiver.
    pub fn new(
        config: &WorkerConfig,
        handles: WorkerHandles,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>), SwError> {
        config.validate()?;
        let origin = config.origin_url()?;
        let relay_url = config.relay_url()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let partitions = Arc::new(PartitionSet::from_config(config));
        let strategies = Strategies::new(handles.fetcher.clone(), handles.caches.clone())
            .with_network_timeout(config.network_timeout())
            .with_shell(partitions.get(CacheRole::Static).clone());
        let lifecycle = Lifecycle::new(
            origin.clone(),
            config.precache.clone(),
            partitions.clone(),
            handles.caches.clone(),
            handles.fetcher.clone(),
            event_tx.clone(),
        );
        let sync = SyncTrigger::new(
            handles.queue.clone(),
            handles.fetcher.clone(),
            relay_url.clone(),
            config.sync_tag.clone(),
        );
        let submitter = FormSubmitter::new(handles.fetcher, handles.queue, relay_url);

        Ok((
            Self {
                router: Router::new(&origin, &config.api_prefix, &config.static_extensions),
                partitions,
                strategies,
                lifecycle,
                sync,
                submitter,
                event_tx,
            },
            event_rx,
        ))
    }

    pub async fn install(&self) -> Result<InstallReport, SwError> {
        self.lifecycle.install().await
    }

    pub async fn activate(&self) -> Result<ActivateReport, SwError> {
        self.lifecycle.activate().await
    }

    /// Install then activate, the way a first-time visitor's worker starts.
    pub async fn start(&self) -> Result<(InstallReport, ActivateReport), SwError> {
        let installed = self.install().await?;
        let activated = self.activate().await?;
        Ok((installed, activated))
    }

    pub async fn state(&self) -> WorkerState {
        self.lifecycle.state().await
    }

    /// Intercept a request.
    ///
    /// `None` means the worker does not respond and the host performs its
    /// default network handling: the worker has never been activated, or the
    /// request is cross-origin. A reinstall does not interrupt interception.
    pub async fn handle_fetch(&self, request: Request) -> Option<Response> {
        if !self.lifecycle.is_controlling() {
            trace!(url = %request.url, "Worker not active, passing through");
            return None;
        }

        let route = self.router.route(&request);
        debug!(url = %request.url, method = %request.method, ?route, "Fetch");
        match route {
            Route::Passthrough => None,
            Route::NetworkFirst(role) => Some(
                self.strategies
                    .network_first(self.partitions.get(role), request)
                    .await,
            ),
            Route::CacheFirst(role) => Some(
                self.strategies
                    .cache_first(self.partitions.get(role), request)
                    .await,
            ),
        }
    }

    /// Handle a background sync signal.
    pub async fn handle_sync(&self, tag: &str) -> Result<Option<SyncReport>, SwError> {
        let report = self.sync.handle_sync(tag).await?;
        if let Some(report) = &report {
            let _ = self.event_tx.send(WorkerEvent::SyncCompleted(report.clone()));
        }
        Ok(report)
    }

    /// Send a form, queueing it when the relay is unreachable.
    pub async fn submit_form(&self, payload: Payload) -> SubmissionOutcome {
        self.submitter.submit(payload).await
    }

    /// Queue a form for the next sync without trying the network.
    pub async fn enqueue_submission(&self, payload: Payload) -> Result<PendingSubmission, SwError> {
        self.submitter.enqueue(payload).await
    }

    pub async fn register_client(&self, id: &str, url: Url) {
        self.lifecycle.add_client(id, url).await;
    }

    pub async fn is_controlled(&self, client_id: &str) -> bool {
        self.lifecycle.is_controlled(client_id).await
    }

    pub fn partitions(&self) -> &PartitionSet {
        &self.partitions
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn sync_tag(&self) -> &str {
        self.sync.tag()
    }
}
