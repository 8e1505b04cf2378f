//! Read interface over the authoritative entity store.
//!
//! External writers own layers, experiments and field types; the core only reads them, either in
//! full at startup or entity-by-entity when a change-log row arrives.
use async_trait::async_trait;

use crate::model::{Experiment, FieldTypes, Layer};
use crate::Result;

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch a single layer. `Ok(None)` when the layer does not exist (e.g. it was deleted after
    /// the change-log row was written).
    async fn layer(&self, layer_id: &str) -> Result<Option<Layer>>;

    async fn list_layers(&self) -> Result<Vec<Layer>>;

    /// Fetch a single experiment by eid.
    async fn experiment(&self, eid: i64) -> Result<Option<Experiment>>;

    async fn list_experiments(&self) -> Result<Vec<Experiment>>;

    /// The current field-type declarations.
    async fn field_types(&self) -> Result<FieldTypes>;
}
