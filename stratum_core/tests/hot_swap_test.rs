//! Hot-swap behavior with the full sync stack: memory store → poller thread → state manager →
//! snapshot store.
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use stratum_core::broadcast::SubscriberRegistry;
use stratum_core::config::{FanoutConfig, SyncConfig};
use stratum_core::eval::{EvaluationRequest, Evaluator};
use stratum_core::memory::MemoryStore;
use stratum_core::model::{BucketRange, Experiment, Layer, Variant};
use stratum_core::poller_thread::PollerThread;
use stratum_core::snapshot_store::SnapshotStore;
use stratum_core::state_manager::StateManager;

struct Node {
    snapshots: Arc<SnapshotStore>,
    evaluator: Evaluator,
    poller: PollerThread,
}

fn spawn_node(store: &Arc<MemoryStore>) -> Node {
    let config = SyncConfig::new()
        .with_poll_interval(Duration::from_millis(20))
        .with_poll_jitter(Duration::ZERO)
        .with_reload_timeout(Duration::from_millis(500));

    let snapshots = Arc::new(SnapshotStore::new());
    let registry = Arc::new(SubscriberRegistry::new(
        FanoutConfig::new(),
        snapshots.clone(),
    ));
    let manager = Arc::new(StateManager::new(
        store.clone(),
        snapshots.clone(),
        registry,
        config.clone(),
    ));

    let poller = PollerThread::start_with_config(store.clone(), manager, config)
        .expect("failed to start poller thread");
    poller
        .wait_for_initialization()
        .expect("initial load failed");

    Node {
        evaluator: Evaluator::new(snapshots.clone()),
        snapshots,
        poller,
    }
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn full_layer(vid: i64) -> Layer {
    Layer {
        layer_id: "L1".to_owned(),
        version: "v1".to_owned(),
        priority: 100,
        hash_key: "user_id".to_owned(),
        salt: Some("s".to_owned()),
        services: vec![],
        ranges: vec![BucketRange {
            start: 0,
            end: 10000,
            vid,
        }],
        enabled: true,
    }
}

fn experiment() -> Experiment {
    Experiment {
        eid: 100,
        service: "svc".to_owned(),
        rule: None,
        variants: vec![
            Variant {
                vid: 1001,
                params: json!({"arm": "a"}),
            },
            Variant {
                vid: 1002,
                params: json!({"arm": "b"}),
            },
        ],
    }
}

fn request() -> EvaluationRequest {
    EvaluationRequest {
        services: vec!["svc".to_owned()],
        keys: [("user_id".to_owned(), "u".to_owned())]
            .into_iter()
            .collect(),
        ..Default::default()
    }
}

#[test]
fn layer_update_swaps_without_tearing() {
    let store = Arc::new(MemoryStore::new());
    store.create_experiment(experiment());
    store.create_layer(full_layer(1001));

    let node = spawn_node(&store);

    let before = node.evaluator.evaluate(&request()).unwrap();
    assert_eq!(before.results["svc"].parameters, json!({"arm": "a"}));

    // A reader that acquired its snapshot before the swap keeps it for the whole request.
    let held = node.snapshots.current();
    let held_version = held.version();

    store.update_layer(full_layer(1002));

    assert!(
        wait_until(Duration::from_secs(2), || {
            let response = node.evaluator.evaluate(&request()).unwrap();
            response.results["svc"].parameters == json!({"arm": "b"})
        }),
        "update was not observed within the staleness bound"
    );

    // The held snapshot is untouched: same version, same assignment.
    assert_eq!(held.version(), held_version);
    assert_eq!(
        node.evaluator
            .evaluate_with_snapshot(&request(), &held)
            .unwrap()
            .results["svc"]
            .parameters,
        json!({"arm": "a"})
    );

    node.poller.shutdown().unwrap();
}

#[test]
fn deleted_layer_stops_matching() {
    let store = Arc::new(MemoryStore::new());
    store.create_experiment(experiment());
    store.create_layer(full_layer(1001));

    let node = spawn_node(&store);
    assert_eq!(
        node.evaluator.evaluate(&request()).unwrap().results["svc"].matched_layers,
        vec!["L1".to_owned()]
    );

    store.delete_layer("L1");

    assert!(
        wait_until(Duration::from_secs(2), || {
            let result = node.evaluator.evaluate(&request()).unwrap();
            let svc = &result.results["svc"];
            svc.matched_layers.is_empty() && svc.parameters == json!({})
        }),
        "delete was not observed within the staleness bound"
    );

    node.poller.shutdown().unwrap();
}

#[test]
fn config_created_after_startup_is_picked_up() {
    let store = Arc::new(MemoryStore::new());
    let node = spawn_node(&store);

    // Nothing configured yet.
    let empty = node.evaluator.evaluate(&request()).unwrap();
    assert!(empty.results["svc"].vids.is_empty());

    store.create_experiment(experiment());
    store.create_layer(full_layer(1001));

    assert!(
        wait_until(Duration::from_secs(2), || {
            let response = node.evaluator.evaluate(&request()).unwrap();
            response.results["svc"].vids == vec![1001]
        }),
        "create was not observed within the staleness bound"
    );

    node.poller.shutdown().unwrap();
}

#[test]
fn all_nodes_converge_on_the_same_change() {
    let store = Arc::new(MemoryStore::new());
    store.create_experiment(experiment());
    store.create_layer(full_layer(1001));

    let first = spawn_node(&store);
    let second = spawn_node(&store);

    store.update_layer(full_layer(1002));

    for node in [&first, &second] {
        assert!(
            wait_until(Duration::from_secs(2), || {
                let response = node.evaluator.evaluate(&request()).unwrap();
                response.results["svc"].vids == vec![1002]
            }),
            "a node failed to converge"
        );
    }

    // Once converged, both nodes give byte-identical answers.
    let a = serde_json::to_vec(&first.evaluator.evaluate(&request()).unwrap()).unwrap();
    let b = serde_json::to_vec(&second.evaluator.evaluate(&request()).unwrap()).unwrap();
    assert_eq!(a, b);

    first.poller.shutdown().unwrap();
    second.poller.shutdown().unwrap();
}

#[test]
fn failing_reload_defers_but_later_entries_catch_up() {
    let store = Arc::new(MemoryStore::new());
    store.create_experiment(experiment());
    store.create_layer(full_layer(1001));

    let node = spawn_node(&store);

    // Fail more fetches than one apply retries (4 attempts with the default config), so the
    // entry is deferred at least once; the poller must keep last_id put and retry the same
    // entry until the store recovers.
    store.fail_next_fetches(6);
    store.update_layer(full_layer(1002));

    assert!(
        wait_until(Duration::from_secs(3), || {
            let response = node.evaluator.evaluate(&request()).unwrap();
            response.results["svc"].vids == vec![1002]
        }),
        "deferred entry was never recovered"
    );

    node.poller.shutdown().unwrap();
}
