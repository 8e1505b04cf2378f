//! The append-only change log that drives configuration sync.
//!
//! The log is the authoritative ordering of all configuration mutations. Rows carry only
//! identity, never entity content: the state manager reloads the current entity from the
//! authoritative store, so stale in-flight payloads cannot exist and the log stays compact.
use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use crate::model::Timestamp;
use crate::Result;

/// Which kind of entity a change-log row refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Layer,
    Experiment,
}

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// One row of the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// Monotonically increasing id; the authoritative ordering.
    pub id: i64,
    pub entity_type: EntityType,
    /// `layer_id` for layers, decimal `eid` for experiments.
    pub entity_id: String,
    pub operation: Operation,
    pub created_at: Timestamp,
}

impl ChangeLogEntry {
    /// Parse `entity_id` as an experiment id.
    pub fn eid(&self) -> Option<i64> {
        self.entity_id.parse().ok()
    }
}

/// Read interface over the change log. Writers append rows atomically with the corresponding
/// entity mutation; the core only ever reads.
#[async_trait]
pub trait ChangeLogSource: Send + Sync {
    /// The largest id currently in the log, or 0 when the log is empty.
    async fn latest_id(&self) -> Result<i64>;

    /// Rows with `id > last_id`, ordered by id ascending, at most `limit` of them.
    async fn entries_after(&self, last_id: i64, limit: usize) -> Result<Vec<ChangeLogEntry>>;
}
