use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

use stratum_core::eval::{EvaluationRequest, Evaluator};
use stratum_core::model::{
    BucketRange, Experiment, FieldType, FieldTypes, Layer, Op, RuleNode, Variant,
};
use stratum_core::snapshot::Snapshot;
use stratum_core::snapshot_store::SnapshotStore;

fn snapshot(layer_count: i64) -> Snapshot {
    let field_types: FieldTypes = [
        ("country".to_owned(), FieldType::String),
        ("age".to_owned(), FieldType::Int),
    ]
    .into_iter()
    .collect();

    let mut layers = Vec::new();
    let mut experiments = Vec::new();
    for i in 0..layer_count {
        let vid = 1000 + i * 2;
        layers.push(Layer {
            layer_id: format!("layer_{i}"),
            version: "v1".to_owned(),
            priority: i as i32,
            hash_key: "user_id".to_owned(),
            salt: None,
            services: vec![],
            ranges: vec![
                BucketRange {
                    start: 0,
                    end: 5000,
                    vid,
                },
                BucketRange {
                    start: 5000,
                    end: 10000,
                    vid: vid + 1,
                },
            ],
            enabled: true,
        });
        experiments.push(Experiment {
            eid: i,
            service: "svc".to_owned(),
            rule: Some(RuleNode::And {
                children: vec![
                    RuleNode::Field {
                        field: "country".to_owned(),
                        op: Op::In,
                        values: vec!["US".into(), "CA".into()],
                    },
                    RuleNode::Field {
                        field: "age".to_owned(),
                        op: Op::Gte,
                        values: vec![18i64.into()],
                    },
                ],
            }),
            variants: vec![
                Variant {
                    vid,
                    params: json!({"timeout": i, "cfg": {"x": i, "flags": {"a": true}}}),
                },
                Variant {
                    vid: vid + 1,
                    params: json!({"timeout": i + 1, "cfg": {"y": i, "flags": {"b": false}}}),
                },
            ],
        });
    }

    Snapshot::build(layers, experiments, Arc::new(field_types), 1)
}

fn criterion_benchmark(c: &mut Criterion) {
    let request = EvaluationRequest {
        services: vec!["svc".to_owned()],
        keys: [("user_id".to_owned(), "user-123456".to_owned())]
            .into_iter()
            .collect(),
        context: [
            ("country".to_owned(), "US".into()),
            ("age".to_owned(), 25.0.into()),
        ]
        .into_iter()
        .collect(),
        layers: vec![],
    };

    for layer_count in [1, 10, 50] {
        let store = Arc::new(SnapshotStore::new());
        store.publish(snapshot(layer_count));
        let evaluator = Evaluator::new(store);

        let mut group = c.benchmark_group(format!("{layer_count}-layers"));
        group.throughput(Throughput::Elements(1));
        group.bench_function("evaluate", |b| {
            b.iter(|| evaluator.evaluate(black_box(&request)))
        });
        group.finish();
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
