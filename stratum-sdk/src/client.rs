use std::sync::Arc;

use stratum_core::broadcast::{SubscriberRegistry, Subscription};
use stratum_core::change_log::ChangeLogSource;
use stratum_core::entity_store::EntityStore;
use stratum_core::eval::{EvaluationRequest, EvaluationResponse, Evaluator};
use stratum_core::model::FieldTypes;
use stratum_core::poller_thread::PollerThread;
use stratum_core::snapshot::Snapshot;
use stratum_core::snapshot_store::SnapshotStore;
use stratum_core::state_manager::StateManager;
use stratum_core::Result;

use crate::ClientConfig;

/// A client for the stratum experimentation platform.
///
/// The client wires the evaluation core together: a snapshot store serving the lock-free read
/// path, a state manager applying change-log entries, and a poller thread keeping both in sync
/// with the authoritative store.
///
/// # Poller Thread
///
/// Before calling [`StratumClient::evaluate`], you should start the poller thread by calling
/// [`StratumClient::start_poller_thread`], ensuring that configuration is loaded. It's also
/// recommended to call [`StratumClient::wait_for_initialization`] before serving traffic;
/// evaluations against a client that has not finished initializing see an empty configuration
/// and return empty parameter bundles.
///
/// # Examples
/// ```no_run
/// # use std::sync::Arc;
/// # use stratum::{ClientConfig, StratumClient};
/// # use stratum_core::memory::MemoryStore;
/// let store = Arc::new(MemoryStore::new());
/// let mut client = StratumClient::new(ClientConfig::new(), store.clone(), store);
/// client.start_poller_thread().expect("failed to start poller");
/// client.wait_for_initialization().expect("initial load failed");
/// ```
pub struct StratumClient {
    store: Arc<dyn EntityStore>,
    change_log: Arc<dyn ChangeLogSource>,
    config: ClientConfig,
    snapshots: Arc<SnapshotStore>,
    manager: Arc<StateManager>,
    evaluator: Evaluator,
    poller: Option<PollerThread>,
}

impl StratumClient {
    /// Create a new `StratumClient` over an authoritative store and its change log.
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn EntityStore>,
        change_log: Arc<dyn ChangeLogSource>,
    ) -> StratumClient {
        let snapshots = Arc::new(SnapshotStore::new());
        let registry = Arc::new(SubscriberRegistry::new(
            config.fanout.clone(),
            snapshots.clone(),
        ));
        let manager = Arc::new(StateManager::new(
            store.clone(),
            snapshots.clone(),
            registry,
            config.sync.clone(),
        ));

        StratumClient {
            store,
            change_log,
            config,
            evaluator: Evaluator::new(snapshots.clone()),
            snapshots,
            manager,
            poller: None,
        }
    }

    /// Start the background poller thread. Idempotent: a second call is a no-op.
    pub fn start_poller_thread(&mut self) -> Result<()> {
        if self.poller.is_none() {
            let poller = PollerThread::start_with_config(
                self.change_log.clone(),
                self.manager.clone(),
                self.config.sync.clone(),
            )?;
            self.poller = Some(poller);
        }
        Ok(())
    }

    /// Block until the initial configuration snapshot has been published.
    pub fn wait_for_initialization(&self) -> Result<()> {
        match &self.poller {
            Some(poller) => poller.wait_for_initialization(),
            None => {
                log::warn!(target: "stratum",
                    "waiting for initialization before the poller thread was started");
                Ok(())
            }
        }
    }

    /// Evaluate a request against the current configuration snapshot.
    pub fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationResponse> {
        self.evaluator.evaluate(request)
    }

    /// Acquire a handle to the current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.current()
    }

    /// Register a downstream subscriber for configuration fan-out.
    pub fn subscribe(
        &self,
        id: impl Into<String>,
        services: Vec<String>,
        known_version: i64,
    ) -> Result<Subscription> {
        self.manager.registry().subscribe(id, services, known_version)
    }

    /// Record the configuration version a subscriber has applied.
    pub fn ack(&self, id: &str, applied_version: i64) -> Result<()> {
        self.manager.registry().ack(id, applied_version)
    }

    /// Re-send a full configuration reload to a (typically stale) subscriber.
    pub fn resync(&self, id: &str) -> Result<()> {
        self.manager.registry().resync(id)
    }

    /// Replace the field-type declarations.
    pub fn set_field_types(&self, field_types: FieldTypes) {
        self.manager.set_field_types(field_types)
    }

    /// The current field-type declarations.
    pub fn get_field_types(&self) -> Arc<FieldTypes> {
        self.manager.get_field_types()
    }

    /// The authoritative store this client reads from.
    pub fn entity_store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// Stop the poller thread and wait for it to exit.
    pub fn shutdown(mut self) -> Result<()> {
        if let Some(poller) = self.poller.take() {
            poller.shutdown()?;
        }
        Ok(())
    }
}
