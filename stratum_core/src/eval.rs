//! The evaluation API: validate a request, dispatch to the merger against the current snapshot,
//! format the response.
//!
//! This path is deliberately synchronous and allocation-light: acquiring the snapshot is a single
//! atomic load and nothing from here to the response suspends or takes a lock.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bucketer::Xxh3Bucketer;
use crate::merge;
use crate::metrics;
use crate::snapshot::Snapshot;
use crate::snapshot_store::SnapshotStore;
use crate::{Attributes, Error, Result};

/// An evaluation request: which services to resolve parameters for, the identifying keys used for
/// bucketing, and the typed context the targeting rules run against.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvaluationRequest {
    pub services: Vec<String>,
    /// Identifying keys by name, e.g. `user_id`, `device_id`. A layer picks the key named by its
    /// `hash_key`; layers whose key is absent are skipped.
    #[serde(default)]
    pub keys: HashMap<String, String>,
    #[serde(default)]
    pub context: Attributes,
    /// Optional explicit layer targeting: when non-empty, exactly these layers are evaluated
    /// (still in priority order) instead of the per-service index. Unknown ids are skipped.
    #[serde(default)]
    pub layers: Vec<String>,
}

/// Merged outcome for a single service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceResult {
    /// The merged parameter bundle. Always a JSON object.
    pub parameters: serde_json::Value,
    /// Variant ids that contributed, in merge order (priority desc, then layer id asc).
    pub vids: Vec<i64>,
    /// Layers that contributed, in the same order.
    pub matched_layers: Vec<String>,
}

impl ServiceResult {
    pub(crate) fn empty() -> ServiceResult {
        ServiceResult {
            parameters: serde_json::Value::Object(serde_json::Map::new()),
            vids: Vec::new(),
            matched_layers: Vec::new(),
        }
    }
}

/// Evaluation response: one [`ServiceResult`] per requested service.
///
/// Uses a `BTreeMap` so the serialized form is byte-identical for identical inputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationResponse {
    pub results: BTreeMap<String, ServiceResult>,
}

/// Evaluator resolves parameter bundles against the currently published snapshot.
pub struct Evaluator {
    snapshot_store: Arc<SnapshotStore>,
    bucketer: Xxh3Bucketer,
}

impl Evaluator {
    pub fn new(snapshot_store: Arc<SnapshotStore>) -> Evaluator {
        Evaluator {
            snapshot_store,
            bucketer: Xxh3Bucketer,
        }
    }

    /// Evaluate a request against the current snapshot.
    ///
    /// Acquires a snapshot handle once; a config change applied while this request is in flight
    /// does not affect the result.
    pub fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationResponse> {
        metrics::EVAL_REQUESTS_TOTAL.inc();

        let snapshot = match validate(request) {
            Ok(()) => self.snapshot_store.current(),
            Err(err) => {
                metrics::EVAL_ERRORS_TOTAL.inc();
                return Err(err);
            }
        };

        match merge::merge(request, &snapshot, &self.bucketer) {
            Ok(results) => Ok(EvaluationResponse { results }),
            Err(err) => {
                metrics::EVAL_ERRORS_TOTAL.inc();
                Err(err)
            }
        }
    }

    /// Evaluate against an explicitly provided snapshot. The request is still validated.
    pub fn evaluate_with_snapshot(
        &self,
        request: &EvaluationRequest,
        snapshot: &Snapshot,
    ) -> Result<EvaluationResponse> {
        validate(request)?;
        let results = merge::merge(request, snapshot, &self.bucketer)?;
        Ok(EvaluationResponse { results })
    }
}

fn validate(request: &EvaluationRequest) -> Result<()> {
    if request.services.is_empty() {
        return Err(Error::InvalidRequest("services must not be empty"));
    }
    if request.keys.is_empty() {
        return Err(Error::InvalidRequest(
            "at least one identifying key is required",
        ));
    }
    Ok(())
}
