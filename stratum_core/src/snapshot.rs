//! Immutable configuration snapshots.
//!
//! A [`Snapshot`] is the read side of the whole system: every evaluation runs against exactly one
//! snapshot acquired at request start, so a config change applied mid-request can never tear a
//! result. Snapshots are built from raw entity sets, never mutated; the state manager publishes a
//! fresh one on every applied change.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::LoadError;
use crate::metrics;
use crate::model::{Experiment, FieldTypes, Layer, RuleNode};

/// A variant resolved through the vid index.
#[derive(Debug, Clone, Copy)]
pub struct VariantLookup<'a> {
    pub eid: i64,
    pub service: &'a str,
    /// Targeting rule of the owning experiment. `None` always matches.
    pub rule: Option<&'a RuleNode>,
    pub params: &'a serde_json::Value,
}

#[derive(Debug)]
struct VariantEntry {
    experiment: Arc<Experiment>,
    index: usize,
}

/// Immutable in-memory view of all layers, experiments and field types at a version.
///
/// All lookups the merger needs are precomputed here: the per-service layer lists are already
/// sorted by priority, and the vid index resolves a range hit to its experiment without scanning.
#[derive(Debug, Default)]
pub struct Snapshot {
    layers: HashMap<String, Arc<Layer>>,
    experiments: HashMap<i64, Arc<Experiment>>,
    variant_index: HashMap<i64, VariantEntry>,
    layers_by_service: HashMap<String, Vec<Arc<Layer>>>,
    /// Resolved service scope per layer (explicit, or inferred from the catalog).
    layer_services: HashMap<String, Vec<String>>,
    field_types: Arc<FieldTypes>,
    version: i64,
}

impl Snapshot {
    /// An empty snapshot at version 0. Served until the state manager publishes a real one.
    pub fn empty() -> Snapshot {
        Snapshot::default()
    }

    /// Build a snapshot from raw entity sets.
    ///
    /// Building never fails as a whole: an invalid layer or experiment is logged, counted and
    /// omitted, and the rest of the configuration keeps serving. Entities are processed in id
    /// order so that rejection is deterministic across processes holding the same entity sets.
    pub fn build(
        mut layers: Vec<Layer>,
        mut experiments: Vec<Experiment>,
        field_types: Arc<FieldTypes>,
        version: i64,
    ) -> Snapshot {
        layers.sort_by(|a, b| a.layer_id.cmp(&b.layer_id));
        experiments.sort_by_key(|e| e.eid);

        let mut snapshot = Snapshot {
            field_types,
            version,
            ..Snapshot::default()
        };

        for experiment in experiments {
            let eid = experiment.eid;
            if let Err(err) = snapshot.admit_experiment(experiment) {
                metrics::SNAPSHOT_LOAD_ERRORS_TOTAL.inc();
                log::warn!(target: "stratum", eid; "rejected experiment: {err}");
            }
        }

        // Tracks which layer claims each vid, for the cross-layer disjointness check.
        let mut claimed_vids: HashMap<i64, String> = HashMap::new();
        for layer in layers {
            let layer_id = layer.layer_id.clone();
            if let Err(err) = snapshot.admit_layer(layer, &mut claimed_vids) {
                metrics::SNAPSHOT_LOAD_ERRORS_TOTAL.inc();
                log::warn!(target: "stratum", layer_id = layer_id.as_str(); "rejected layer: {err}");
            }
        }

        snapshot.build_service_index();
        snapshot
    }

    fn admit_experiment(&mut self, experiment: Experiment) -> Result<(), LoadError> {
        if self.experiments.contains_key(&experiment.eid) {
            return Err(LoadError::DuplicateEid(experiment.eid));
        }

        if let Some(rule) = &experiment.rule {
            rule.validate(&self.field_types)?;
        }

        let mut seen = HashSet::new();
        for variant in &experiment.variants {
            if !variant.params.is_object() {
                return Err(LoadError::ParamsNotObject { vid: variant.vid });
            }
            if self.variant_index.contains_key(&variant.vid) || !seen.insert(variant.vid) {
                return Err(LoadError::DuplicateVid {
                    vid: variant.vid,
                    owner: "experiment",
                });
            }
        }

        let experiment = Arc::new(experiment);
        for (index, variant) in experiment.variants.iter().enumerate() {
            self.variant_index.insert(
                variant.vid,
                VariantEntry {
                    experiment: experiment.clone(),
                    index,
                },
            );
        }
        self.experiments.insert(experiment.eid, experiment);
        Ok(())
    }

    fn admit_layer(
        &mut self,
        mut layer: Layer,
        claimed_vids: &mut HashMap<i64, String>,
    ) -> Result<(), LoadError> {
        layer.normalize()?;

        let vids: HashSet<i64> = layer.ranges.iter().map(|r| r.vid).collect();
        for &vid in &vids {
            if !self.variant_index.contains_key(&vid) {
                return Err(LoadError::UnknownVid { vid });
            }
            if let Some(owner) = claimed_vids.get(&vid) {
                if *owner != layer.layer_id {
                    return Err(LoadError::DuplicateVid {
                        vid,
                        owner: "layer",
                    });
                }
            }
        }
        for &vid in &vids {
            claimed_vids.insert(vid, layer.layer_id.clone());
        }

        self.layers.insert(layer.layer_id.clone(), Arc::new(layer));
        Ok(())
    }

    /// Rebuild the service inverted index. Services come from the layer's explicit scope when
    /// present, otherwise from the catalog via the layer's vids.
    fn build_service_index(&mut self) {
        let mut by_service: HashMap<String, Vec<Arc<Layer>>> = HashMap::new();
        let mut layer_services: HashMap<String, Vec<String>> = HashMap::new();

        for layer in self.layers.values() {
            let mut services: Vec<String> = if layer.services.is_empty() {
                let inferred: HashSet<&str> = layer
                    .ranges
                    .iter()
                    .filter_map(|r| self.variant_index.get(&r.vid))
                    .map(|entry| entry.experiment.service.as_str())
                    .collect();
                inferred.into_iter().map(str::to_owned).collect()
            } else {
                layer.services.clone()
            };
            services.sort();
            services.dedup();

            for service in &services {
                by_service
                    .entry(service.clone())
                    .or_default()
                    .push(layer.clone());
            }
            layer_services.insert(layer.layer_id.clone(), services);
        }

        for layers in by_service.values_mut() {
            layers.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.layer_id.cmp(&b.layer_id))
            });
        }

        self.layers_by_service = by_service;
        self.layer_services = layer_services;
    }

    /// Layers applicable to a service, ordered by priority desc, then layer id asc.
    pub fn layers_for(&self, service: &str) -> &[Arc<Layer>] {
        self.layers_by_service
            .get(service)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn layer(&self, layer_id: &str) -> Option<&Arc<Layer>> {
        self.layers.get(layer_id)
    }

    pub fn experiment(&self, eid: i64) -> Option<&Arc<Experiment>> {
        self.experiments.get(&eid)
    }

    /// Resolve a vid to its experiment and parameters.
    pub fn variant(&self, vid: i64) -> Option<VariantLookup<'_>> {
        let entry = self.variant_index.get(&vid)?;
        let experiment = entry.experiment.as_ref();
        let variant = experiment.variants.get(entry.index)?;
        Some(VariantLookup {
            eid: experiment.eid,
            service: &experiment.service,
            rule: experiment.rule.as_ref(),
            params: &variant.params,
        })
    }

    /// Resolved service scope of a layer.
    pub fn services_of(&self, layer_id: &str) -> &[String] {
        self.layer_services
            .get(layer_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn layers(&self) -> impl Iterator<Item = &Arc<Layer>> {
        self.layers.values()
    }

    pub fn experiments(&self) -> impl Iterator<Item = &Arc<Experiment>> {
        self.experiments.values()
    }

    pub fn field_types(&self) -> &FieldTypes {
        &self.field_types
    }

    pub(crate) fn field_types_handle(&self) -> Arc<FieldTypes> {
        self.field_types.clone()
    }

    pub fn version(&self) -> i64 {
        self.version
    }
}
