//! Priority-biased parameter merging across layers.
use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::bucketer::Bucketer;
use crate::eval::{EvaluationRequest, ServiceResult};
use crate::metrics;
use crate::model::Layer;
use crate::snapshot::Snapshot;
use crate::{Error, Result};

/// Merge parameters for every requested service against one snapshot.
///
/// Layers are processed from highest priority down; keys set by an earlier (higher-priority)
/// layer are never changed by a later one. Per-layer failures — a missing hash key, a bucket
/// falling into a range hole, a rule error — skip that layer only and are recorded in counters.
pub fn merge(
    request: &EvaluationRequest,
    snapshot: &Snapshot,
    bucketer: &impl Bucketer,
) -> Result<BTreeMap<String, ServiceResult>> {
    let mut results = BTreeMap::new();

    // Explicit layer targeting bypasses the per-service index but keeps the merge order.
    let targeted: Option<Vec<Arc<Layer>>> = if request.layers.is_empty() {
        None
    } else {
        let mut layers: Vec<Arc<Layer>> = request
            .layers
            .iter()
            .filter_map(|id| snapshot.layer(id).cloned())
            .collect();
        layers.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.layer_id.cmp(&b.layer_id))
        });
        Some(layers)
    };

    for service in &request.services {
        let layers = match &targeted {
            Some(layers) => layers.as_slice(),
            None => snapshot.layers_for(service),
        };
        let result = merge_service(service, layers, request, snapshot, bucketer)?;
        results.insert(service.clone(), result);
    }

    Ok(results)
}

fn merge_service(
    service: &str,
    layers: &[Arc<Layer>],
    request: &EvaluationRequest,
    snapshot: &Snapshot,
    bucketer: &impl Bucketer,
) -> Result<ServiceResult> {
    let mut result = ServiceResult::empty();
    let Value::Object(acc) = &mut result.parameters else {
        unreachable!("ServiceResult::empty always holds an object");
    };

    for layer in layers {
        if !layer.enabled {
            continue;
        }

        let Some(key) = request.keys.get(&layer.hash_key) else {
            metrics::MERGE_MISSING_KEY_TOTAL.inc();
            log::debug!(target: "stratum",
                layer_id = layer.layer_id.as_str(),
                hash_key = layer.hash_key.as_str();
                "request has no key for layer, skipping");
            continue;
        };

        let bucket = bucketer.bucket(key, &layer.salt());
        let Some(vid) = layer.vid_for_bucket(bucket) else {
            metrics::MERGE_RANGE_MISS_TOTAL.inc();
            continue;
        };

        // The snapshot builder guarantees every range vid resolves; a miss here means the
        // snapshot is corrupted and the whole service result is unusable.
        let Some(variant) = snapshot.variant(vid) else {
            return Err(Error::SnapshotCorrupted { vid });
        };

        if variant.service != service {
            continue;
        }

        if let Some(rule) = variant.rule {
            match rule.evaluate(&request.context, snapshot.field_types()) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    metrics::MERGE_RULE_ERRORS_TOTAL.inc();
                    log::debug!(target: "stratum",
                        layer_id = layer.layer_id.as_str(),
                        eid = variant.eid,
                        vid;
                        "rule evaluation failed, treating as non-match: {err}");
                    continue;
                }
            }
        }

        if let Value::Object(params) = variant.params {
            merge_params(acc, params);
        }
        result.vids.push(vid);
        result.matched_layers.push(layer.layer_id.clone());
    }

    Ok(result)
}

/// Deep merge `incoming` into `acc` where `acc` wins on conflicts.
///
/// Both sides union keys; intersecting keys recurse when both values are objects, otherwise the
/// already-present value is preserved whole. Arrays are opaque values.
pub(crate) fn merge_params(acc: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        match acc.get_mut(key) {
            None => {
                acc.insert(key.clone(), value.clone());
            }
            Some(Value::Object(existing)) => {
                if let Value::Object(incoming_object) = value {
                    merge_params(existing, incoming_object);
                }
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn merge_adds_new_keys_and_keeps_existing() {
        let mut acc = object(json!({"timeout": 100}));
        merge_params(&mut acc, &object(json!({"timeout": 200, "extra": "v"})));

        assert_eq!(Value::Object(acc), json!({"timeout": 100, "extra": "v"}));
    }

    #[test]
    fn merge_recurses_into_objects() {
        let mut acc = object(json!({"cfg": {"x": 1, "y": 2}}));
        merge_params(&mut acc, &object(json!({"cfg": {"x": 10, "z": 3}})));

        assert_eq!(
            Value::Object(acc),
            json!({"cfg": {"x": 1, "y": 2, "z": 3}})
        );
    }

    #[test]
    fn merge_preserves_winner_on_type_mismatch() {
        let mut acc = object(json!({"cfg": {"x": 1}}));
        merge_params(&mut acc, &object(json!({"cfg": 42})));
        assert_eq!(Value::Object(acc), json!({"cfg": {"x": 1}}));

        let mut acc = object(json!({"cfg": 42}));
        merge_params(&mut acc, &object(json!({"cfg": {"x": 1}})));
        assert_eq!(Value::Object(acc), json!({"cfg": 42}));
    }

    #[test]
    fn merge_treats_arrays_as_opaque() {
        let mut acc = object(json!({"list": [1, 2]}));
        merge_params(&mut acc, &object(json!({"list": [3, 4, 5]})));
        assert_eq!(Value::Object(acc), json!({"list": [1, 2]}));
    }

    #[test]
    fn merge_is_deep() {
        let mut acc = object(json!({"a": {"b": {"c": 1}}}));
        merge_params(&mut acc, &object(json!({"a": {"b": {"d": 2}, "e": 3}})));

        assert_eq!(
            Value::Object(acc),
            json!({"a": {"b": {"c": 1, "d": 2}, "e": 3}})
        );
    }
}
