//! Telemetry counters for the evaluation and sync paths.
//!
//! Counters only; exporting them (HTTP scrape endpoint, push gateway, ...) is the embedding
//! application's job via [`REGISTRY`].
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Evaluation path.
    pub static ref EVAL_REQUESTS_TOTAL: IntCounter = IntCounter::new(
        "stratum_eval_requests_total",
        "Total number of evaluation requests"
    ).expect("metric definition is valid");

    pub static ref EVAL_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "stratum_eval_errors_total",
        "Total number of evaluation requests rejected or failed"
    ).expect("metric definition is valid");

    // Per-layer skip reasons during merge.
    pub static ref MERGE_MISSING_KEY_TOTAL: IntCounter = IntCounter::new(
        "stratum_merge_missing_key_total",
        "Layers skipped because the request lacked the layer's hash key"
    ).expect("metric definition is valid");

    pub static ref MERGE_RANGE_MISS_TOTAL: IntCounter = IntCounter::new(
        "stratum_merge_range_miss_total",
        "Layers skipped because the bucket fell outside all ranges"
    ).expect("metric definition is valid");

    pub static ref MERGE_RULE_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "stratum_merge_rule_errors_total",
        "Rules that failed to evaluate and were treated as non-matches"
    ).expect("metric definition is valid");

    // Snapshot builds.
    pub static ref SNAPSHOT_LOAD_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "stratum_snapshot_load_errors_total",
        "Entities rejected during snapshot builds"
    ).expect("metric definition is valid");

    pub static ref SNAPSHOT_PUBLISH_TOTAL: IntCounter = IntCounter::new(
        "stratum_snapshot_publish_total",
        "Snapshots published via atomic swap"
    ).expect("metric definition is valid");

    // Change-log sync.
    pub static ref CHANGELOG_APPLIED_TOTAL: IntCounter = IntCounter::new(
        "stratum_changelog_applied_total",
        "Change-log entries applied"
    ).expect("metric definition is valid");

    pub static ref CHANGELOG_DEFERRED_TOTAL: IntCounter = IntCounter::new(
        "stratum_changelog_deferred_total",
        "Change-log entries deferred because the entity reload kept failing"
    ).expect("metric definition is valid");

    // Fan-out.
    pub static ref SUBSCRIBER_DROPS_TOTAL: IntCounter = IntCounter::new(
        "stratum_subscriber_drops_total",
        "Events dropped because a subscriber queue was full"
    ).expect("metric definition is valid");

    pub static ref SUBSCRIBERS_ACTIVE: IntGauge = IntGauge::new(
        "stratum_subscribers_active",
        "Currently registered subscribers"
    ).expect("metric definition is valid");
}

/// Register all counters with [`REGISTRY`]. Call once at process startup.
pub fn register() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(EVAL_REQUESTS_TOTAL.clone()),
        Box::new(EVAL_ERRORS_TOTAL.clone()),
        Box::new(MERGE_MISSING_KEY_TOTAL.clone()),
        Box::new(MERGE_RANGE_MISS_TOTAL.clone()),
        Box::new(MERGE_RULE_ERRORS_TOTAL.clone()),
        Box::new(SNAPSHOT_LOAD_ERRORS_TOTAL.clone()),
        Box::new(SNAPSHOT_PUBLISH_TOTAL.clone()),
        Box::new(CHANGELOG_APPLIED_TOTAL.clone()),
        Box::new(CHANGELOG_DEFERRED_TOTAL.clone()),
        Box::new(SUBSCRIBER_DROPS_TOTAL.clone()),
        Box::new(SUBSCRIBERS_ACTIVE.clone()),
    ];
    for collector in collectors {
        // Ignore AlreadyReg errors so register() is safe to call twice (e.g. in tests).
        let _ = REGISTRY.register(collector);
    }
}
