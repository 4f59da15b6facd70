//! Document pipeline benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use docbase_core::{
    CollectionParameters, CollectionType, Database, DocumentSelector, IndexDefinition,
    IndexLookup, OperationOptions,
};
use serde_json::json;

fn setup(with_index: bool) -> Database {
    let db = Database::open_in_memory().unwrap();
    let items = db
        .create_collection(CollectionParameters::new("bench", CollectionType::Document))
        .unwrap();
    if with_index {
        let trx = db.begin_transaction();
        items
            .ensure_index(&trx, IndexDefinition::hash(&["group"], false, false))
            .unwrap();
    }
    db
}

/// Benchmark single document inserts.
fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(1));

    for with_index in [false, true] {
        group.bench_with_input(
            BenchmarkId::from_parameter(if with_index { "hash_index" } else { "primary_only" }),
            &with_index,
            |b, &with_index| {
                let db = setup(with_index);
                let items = db.collection("bench").unwrap();
                let trx = db.begin_transaction();
                let options = OperationOptions::default();
                let mut i = 0u64;
                b.iter(|| {
                    i += 1;
                    items
                        .insert(&trx, black_box(json!({"group": i % 64, "n": i})), &options)
                        .unwrap();
                });
            },
        );
    }
    group.finish();
}

/// Benchmark updates of an existing document.
fn bench_update(c: &mut Criterion) {
    let db = setup(true);
    let items = db.collection("bench").unwrap();
    let trx = db.begin_transaction();
    let options = OperationOptions::default();
    items.insert(&trx, json!({"_key": "hot", "group": 0}), &options).unwrap();

    let mut i = 0u64;
    c.bench_function("update", |b| {
        b.iter(|| {
            i += 1;
            items
                .update(
                    &trx,
                    DocumentSelector::key("hot"),
                    black_box(json!({"group": i % 64})),
                    &options,
                )
                .unwrap();
        });
    });
}

/// Benchmark hash index lookups.
fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");

    for count in [1_000, 10_000].iter() {
        let db = setup(false);
        let items = db.collection("bench").unwrap();
        let trx = db.begin_transaction();
        let options = OperationOptions::default();
        for i in 0..*count {
            items.insert(&trx, json!({"group": i % 100}), &options).unwrap();
        }
        let (index, _) = items
            .ensure_index(&trx, IndexDefinition::hash(&["group"], false, false))
            .unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| {
                items
                    .lookup_by_index(
                        &trx,
                        index.definition.id,
                        black_box(&IndexLookup::Equal(vec![json!(42)])),
                    )
                    .unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_insert, bench_update, bench_lookup);
criterion_main!(benches);
