//! The configuration state machine.
//!
//! The state manager owns the raw entity sets (as last fetched from the authoritative store) and
//! is the only writer of the snapshot store. Every applied change-log entry reloads the entity,
//! substitutes it in the raw state, rebuilds the snapshot, publishes it with an atomic swap and
//! emits a [`ConfigChange`] to local subscribers. Readers are never blocked: the writer mutex
//! here serializes writers only.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::broadcast::{ChangeKind, ChangePayload, ConfigChange, SubscriberRegistry};
use crate::change_log::{ChangeLogEntry, EntityType, Operation};
use crate::config::SyncConfig;
use crate::entity_store::EntityStore;
use crate::metrics;
use crate::model::{Experiment, FieldTypes, Layer, Timestamp};
use crate::snapshot::Snapshot;
use crate::snapshot_store::SnapshotStore;
use crate::{Error, Result};

#[derive(Default)]
struct WriterState {
    layers: HashMap<String, Layer>,
    experiments: HashMap<i64, Experiment>,
    field_types: Arc<FieldTypes>,
    version: i64,
}

impl WriterState {
    fn build_snapshot(&self) -> Snapshot {
        Snapshot::build(
            self.layers.values().cloned().collect(),
            self.experiments.values().cloned().collect(),
            self.field_types.clone(),
            self.version,
        )
    }
}

enum EntityRef<'a> {
    Layer(&'a str),
    Experiment(i64),
}

pub struct StateManager {
    store: Arc<dyn EntityStore>,
    snapshots: Arc<SnapshotStore>,
    registry: Arc<SubscriberRegistry>,
    config: SyncConfig,
    /// Serializes writers. Readers go through [`SnapshotStore`] and never touch this.
    state: Mutex<WriterState>,
}

impl StateManager {
    pub fn new(
        store: Arc<dyn EntityStore>,
        snapshots: Arc<SnapshotStore>,
        registry: Arc<SubscriberRegistry>,
        config: SyncConfig,
    ) -> StateManager {
        StateManager {
            store,
            snapshots,
            registry,
            config,
            state: Mutex::new(WriterState::default()),
        }
    }

    /// Load the full configuration from the authoritative store and publish the initial
    /// snapshot. Called once at startup, before the poller begins delivering entries.
    pub async fn initialize(&self) -> Result<()> {
        let layers = self.store.list_layers().await?;
        let experiments = self.store.list_experiments().await?;
        let field_types = self.store.field_types().await?;

        let layer_count = layers.len();
        let experiment_count = experiments.len();

        let mut state = self.state.lock();
        state.layers = layers
            .into_iter()
            .map(|l| (l.layer_id.clone(), l))
            .collect();
        state.experiments = experiments.into_iter().map(|e| (e.eid, e)).collect();
        state.field_types = Arc::new(field_types);
        // Startup version is wall-clock seconds; the max() keeps the version monotonic when a
        // re-initialization races a clock stepping backwards.
        state.version = Utc::now().timestamp().max(state.version + 1);

        let snapshot = state.build_snapshot();
        let version = state.version;
        self.snapshots.publish(snapshot);
        drop(state);

        log::info!(target: "stratum",
            layer_count, experiment_count, version;
            "configuration loaded from store");
        Ok(())
    }

    /// Apply one change-log entry in order.
    ///
    /// Invalid or vanished entities are consumed (logged and counted) so they never wedge the
    /// log. Storage failures and reload timeouts are returned as errors after the configured
    /// retries; the poller defers such entries and does not advance `last_id` past them.
    pub async fn apply(&self, entry: &ChangeLogEntry) -> Result<()> {
        log::debug!(target: "stratum",
            id = entry.id,
            entity_id = entry.entity_id.as_str();
            "applying change-log entry");

        match entry.entity_type {
            EntityType::Layer => self.apply_layer(entry).await?,
            EntityType::Experiment => self.apply_experiment(entry).await?,
        }

        metrics::CHANGELOG_APPLIED_TOTAL.inc();
        Ok(())
    }

    async fn apply_layer(&self, entry: &ChangeLogEntry) -> Result<()> {
        let layer_id = entry.entity_id.as_str();
        match entry.operation {
            Operation::Create | Operation::Update => {
                let Some(layer) = self.reload(|| self.store.layer(layer_id)).await? else {
                    log::warn!(target: "stratum",
                        layer_id;
                        "layer vanished before reload, consuming entry");
                    return Ok(());
                };

                let kind = if entry.operation == Operation::Create {
                    ChangeKind::LayerCreated
                } else {
                    ChangeKind::LayerUpdated
                };
                let payload = ChangePayload::Layer(Arc::new(layer.clone()));
                let change = self.commit(
                    kind,
                    entry.created_at,
                    payload,
                    EntityRef::Layer(layer_id),
                    |state| {
                        state.layers.insert(layer.layer_id.clone(), layer);
                    },
                );
                self.registry.publish(&change);
            }
            Operation::Delete => {
                let change = self.commit(
                    ChangeKind::LayerDeleted,
                    entry.created_at,
                    ChangePayload::DeletedLayer(layer_id.to_owned()),
                    EntityRef::Layer(layer_id),
                    |state| {
                        state.layers.remove(layer_id);
                    },
                );
                self.registry.publish(&change);
            }
        }
        Ok(())
    }

    async fn apply_experiment(&self, entry: &ChangeLogEntry) -> Result<()> {
        let Some(eid) = entry.eid() else {
            log::warn!(target: "stratum",
                entity_id = entry.entity_id.as_str();
                "change-log entry has a non-numeric eid, consuming entry");
            return Ok(());
        };

        match entry.operation {
            Operation::Create | Operation::Update => {
                let Some(experiment) = self.reload(|| self.store.experiment(eid)).await? else {
                    log::warn!(target: "stratum",
                        eid;
                        "experiment vanished before reload, consuming entry");
                    return Ok(());
                };

                let kind = if entry.operation == Operation::Create {
                    ChangeKind::ExperimentCreated
                } else {
                    ChangeKind::ExperimentUpdated
                };
                let payload = ChangePayload::Experiment(Arc::new(experiment.clone()));
                let change = self.commit(
                    kind,
                    entry.created_at,
                    payload,
                    EntityRef::Experiment(eid),
                    |state| {
                        state.experiments.insert(experiment.eid, experiment);
                    },
                );
                self.registry.publish(&change);
            }
            Operation::Delete => {
                let change = self.commit(
                    ChangeKind::ExperimentDeleted,
                    entry.created_at,
                    ChangePayload::DeletedExperiment(eid),
                    EntityRef::Experiment(eid),
                    |state| {
                        state.experiments.remove(&eid);
                    },
                );
                self.registry.publish(&change);
            }
        }
        Ok(())
    }

    /// Mutate the raw state, rebuild and publish the snapshot, and produce the change event.
    /// Holds the writer mutex across mutation and swap so concurrent writers serialize; the
    /// fan-out happens outside the lock.
    fn commit(
        &self,
        kind: ChangeKind,
        timestamp: Timestamp,
        payload: ChangePayload,
        entity: EntityRef<'_>,
        mutate: impl FnOnce(&mut WriterState),
    ) -> ConfigChange {
        let mut state = self.state.lock();
        let prior = self.snapshots.current();

        mutate(&mut state);
        state.version += 1;
        let snapshot = state.build_snapshot();
        let services = affected_services(&prior, &snapshot, &entity);
        let version = state.version;
        self.snapshots.publish(snapshot);
        drop(state);

        ConfigChange {
            kind,
            version,
            timestamp,
            services,
            payload,
        }
    }

    /// Fetch an entity with a bounded timeout, retrying transient failures.
    async fn reload<T, Fut>(&self, mut fetch: impl FnMut() -> Fut) -> Result<Option<T>>
    where
        Fut: Future<Output = Result<Option<T>>>,
    {
        let mut last_error = Error::ReloadTimeout(self.config.reload_timeout);
        for attempt in 0..=self.config.reload_retries {
            match tokio::time::timeout(self.config.reload_timeout, fetch()).await {
                Ok(Ok(entity)) => return Ok(entity),
                Ok(Err(err)) => {
                    log::warn!(target: "stratum",
                        attempt;
                        "entity reload failed: {err}");
                    last_error = err;
                }
                Err(_elapsed) => {
                    log::warn!(target: "stratum",
                        attempt;
                        "entity reload timed out after {:?}", self.config.reload_timeout);
                    last_error = Error::ReloadTimeout(self.config.reload_timeout);
                }
            }
        }

        metrics::CHANGELOG_DEFERRED_TOTAL.inc();
        Err(last_error)
    }

    /// Replace the field-type declarations through the same swap discipline as entity changes.
    ///
    /// Entities whose rules the new map invalidates are rejected by the snapshot build (counted,
    /// logged) while the rest keep serving.
    pub fn set_field_types(&self, field_types: FieldTypes) {
        let mut state = self.state.lock();
        state.field_types = Arc::new(field_types);
        state.version += 1;
        let snapshot = state.build_snapshot();
        self.snapshots.publish(snapshot);
    }

    pub fn get_field_types(&self) -> Arc<FieldTypes> {
        self.state.lock().field_types.clone()
    }

    /// The current snapshot version.
    pub fn version(&self) -> i64 {
        self.state.lock().version
    }

    pub fn snapshot_store(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }
}

fn affected_services(prior: &Snapshot, next: &Snapshot, entity: &EntityRef<'_>) -> Vec<String> {
    let mut services: Vec<String> = match entity {
        EntityRef::Layer(layer_id) => prior
            .services_of(layer_id)
            .iter()
            .chain(next.services_of(layer_id))
            .cloned()
            .collect(),
        EntityRef::Experiment(eid) => [prior.experiment(*eid), next.experiment(*eid)]
            .into_iter()
            .flatten()
            .map(|e| e.service.clone())
            .collect(),
    };
    services.sort();
    services.dedup();
    services
}
