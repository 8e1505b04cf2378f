//! In-memory authoritative store with a built-in change log.
//!
//! [`MemoryStore`] implements both [`EntityStore`] and [`ChangeLogSource`], appending a log row
//! atomically with every entity mutation — the same contract external writers uphold against a
//! real database. It backs single-process embeddings and the integration tests.
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::change_log::{ChangeLogEntry, ChangeLogSource, EntityType, Operation};
use crate::entity_store::EntityStore;
use crate::model::{Experiment, FieldTypes, Layer};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    layers: std::collections::HashMap<String, Layer>,
    experiments: std::collections::HashMap<i64, Experiment>,
    field_types: FieldTypes,
    log: Vec<ChangeLogEntry>,
    next_id: i64,
}

impl Inner {
    fn append(&mut self, entity_type: EntityType, entity_id: String, operation: Operation) -> i64 {
        self.next_id += 1;
        self.log.push(ChangeLogEntry {
            id: self.next_id,
            entity_type,
            entity_id,
            operation,
            created_at: chrono::Utc::now(),
        });
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    /// When non-zero, that many upcoming single-entity fetches fail. Lets tests exercise the
    /// retry/defer path of the state manager.
    fail_fetches: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Replace the field-type declarations. Not a change-log entity; the state manager picks the
    /// map up through [`EntityStore::field_types`] or an explicit `set_field_types` call.
    pub fn set_field_types(&self, field_types: FieldTypes) {
        self.inner.write().field_types = field_types;
    }

    /// Insert or replace a layer, appending a `create` row. Returns the log id.
    pub fn create_layer(&self, layer: Layer) -> i64 {
        let mut inner = self.inner.write();
        let id = layer.layer_id.clone();
        inner.layers.insert(id.clone(), layer);
        inner.append(EntityType::Layer, id, Operation::Create)
    }

    /// Replace a layer, appending an `update` row.
    pub fn update_layer(&self, layer: Layer) -> i64 {
        let mut inner = self.inner.write();
        let id = layer.layer_id.clone();
        inner.layers.insert(id.clone(), layer);
        inner.append(EntityType::Layer, id, Operation::Update)
    }

    /// Remove a layer, appending a `delete` row.
    pub fn delete_layer(&self, layer_id: &str) -> i64 {
        let mut inner = self.inner.write();
        inner.layers.remove(layer_id);
        inner.append(EntityType::Layer, layer_id.to_owned(), Operation::Delete)
    }

    pub fn create_experiment(&self, experiment: Experiment) -> i64 {
        let mut inner = self.inner.write();
        let eid = experiment.eid;
        inner.experiments.insert(eid, experiment);
        inner.append(EntityType::Experiment, eid.to_string(), Operation::Create)
    }

    pub fn update_experiment(&self, experiment: Experiment) -> i64 {
        let mut inner = self.inner.write();
        let eid = experiment.eid;
        inner.experiments.insert(eid, experiment);
        inner.append(EntityType::Experiment, eid.to_string(), Operation::Update)
    }

    pub fn delete_experiment(&self, eid: i64) -> i64 {
        let mut inner = self.inner.write();
        inner.experiments.remove(&eid);
        inner.append(EntityType::Experiment, eid.to_string(), Operation::Delete)
    }

    /// Make the next `count` single-entity fetches fail with a storage error.
    pub fn fail_next_fetches(&self, count: u32) {
        self.fail_fetches.store(count, Ordering::SeqCst);
    }

    fn check_fault(&self) -> Result<()> {
        let remaining = self
            .fail_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if remaining {
            Err(Error::storage(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "injected store failure",
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn layer(&self, layer_id: &str) -> Result<Option<Layer>> {
        self.check_fault()?;
        Ok(self.inner.read().layers.get(layer_id).cloned())
    }

    async fn list_layers(&self) -> Result<Vec<Layer>> {
        Ok(self.inner.read().layers.values().cloned().collect())
    }

    async fn experiment(&self, eid: i64) -> Result<Option<Experiment>> {
        self.check_fault()?;
        Ok(self.inner.read().experiments.get(&eid).cloned())
    }

    async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        Ok(self.inner.read().experiments.values().cloned().collect())
    }

    async fn field_types(&self) -> Result<FieldTypes> {
        Ok(self.inner.read().field_types.clone())
    }
}

#[async_trait]
impl ChangeLogSource for MemoryStore {
    async fn latest_id(&self) -> Result<i64> {
        Ok(self.inner.read().next_id)
    }

    async fn entries_after(&self, last_id: i64, limit: usize) -> Result<Vec<ChangeLogEntry>> {
        let inner = self.inner.read();
        let start = inner.log.partition_point(|e| e.id <= last_id);
        Ok(inner.log[start..]
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }
}
