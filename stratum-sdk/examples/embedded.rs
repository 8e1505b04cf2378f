//! Minimal embedding: seed an in-memory store, start the client, evaluate a request, and watch
//! a configuration change flow through.
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use stratum::{ClientConfig, EvaluationRequest, StratumClient};
use stratum_core::config::SyncConfig;
use stratum_core::memory::MemoryStore;
use stratum_core::model::{BucketRange, Experiment, Layer, Variant};

fn ui_layer(enabled: bool) -> Layer {
    Layer {
        layer_id: "ui".to_owned(),
        version: "v1".to_owned(),
        priority: 10,
        hash_key: "user_id".to_owned(),
        salt: None,
        services: vec![],
        ranges: vec![
            BucketRange {
                start: 0,
                end: 5000,
                vid: 1001,
            },
            BucketRange {
                start: 5000,
                end: 10000,
                vid: 1002,
            },
        ],
        enabled,
    }
}

fn main() {
    let store = Arc::new(MemoryStore::new());
    store.create_experiment(Experiment {
        eid: 100,
        service: "checkout".to_owned(),
        rule: None,
        variants: vec![
            Variant {
                vid: 1001,
                params: json!({"button": "green", "timeout_ms": 800}),
            },
            Variant {
                vid: 1002,
                params: json!({"button": "blue", "timeout_ms": 500}),
            },
        ],
    });
    store.create_layer(ui_layer(true));

    let config = ClientConfig::new()
        .sync_config(SyncConfig::new().with_poll_interval(Duration::from_millis(100)));
    let mut client = StratumClient::new(config, store.clone(), store.clone());
    client.start_poller_thread().expect("failed to start poller");
    client
        .wait_for_initialization()
        .expect("initial load failed");

    let request = EvaluationRequest {
        services: vec!["checkout".to_owned()],
        keys: [("user_id".to_owned(), "user-42".to_owned())]
            .into_iter()
            .collect(),
        ..Default::default()
    };

    let response = client.evaluate(&request).expect("evaluation failed");
    println!(
        "assigned: {}",
        serde_json::to_string_pretty(&response).unwrap()
    );

    // Disable the layer and watch the assignment disappear on the next poll.
    store.update_layer(ui_layer(false));
    std::thread::sleep(Duration::from_millis(300));

    let response = client.evaluate(&request).expect("evaluation failed");
    println!(
        "after disable: {}",
        serde_json::to_string_pretty(&response).unwrap()
    );

    client.shutdown().expect("clean shutdown");
}
