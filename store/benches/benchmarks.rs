//! Performance benchmarks for farmlog-store

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use farmlog_store::{
    derived, CollectionName, FlatStore, Key, KeyRange, Record, RecordStore, StoreConfig,
};
use serde_json::json;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    Runtime::new().unwrap()
}

fn sale(i: u64) -> Record {
    Record::from_value(json!({
        "date": format!("2024-01-{:02}", i % 28 + 1),
        "product": format!("Product {}", i % 50),
        "quantity": i % 100,
        "pricePerUnit": 2.5
    }))
    .unwrap()
}

async fn seeded(store: RecordStore, count: u64) -> RecordStore {
    for i in 0..count {
        store.add(CollectionName::Sales, sale(i)).await.unwrap();
    }
    store
}

async fn structured() -> RecordStore {
    RecordStore::from_config(&StoreConfig::in_memory())
        .await
        .unwrap()
}

fn flat() -> RecordStore {
    RecordStore::flat(FlatStore::in_memory("bench"))
}

fn bench_derived(c: &mut Criterion) {
    let mut group = c.benchmark_group("derived");

    group.bench_function("apply_sale_total", |b| {
        let record = sale(7);
        b.iter(|| {
            let mut record = record.clone();
            derived::apply(CollectionName::Sales, black_box(&mut record));
            record
        })
    });

    group.finish();
}

fn bench_structured(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("structured");

    let store = rt.block_on(async { seeded(structured().await, 1000).await });

    group.bench_function("add", |b| {
        let mut i = 0;
        b.to_async(&rt).iter(|| {
            i += 1;
            let store = store.clone();
            async move { store.add(CollectionName::Sales, sale(i)).await.unwrap() }
        })
    });

    group.bench_function("get", |b| {
        b.to_async(&rt).iter(|| {
            let store = store.clone();
            async move {
                store
                    .get(CollectionName::Sales, black_box(&Key::Int(500)))
                    .await
                    .unwrap()
            }
        })
    });

    group.bench_function("update_quantity", |b| {
        b.to_async(&rt).iter(|| {
            let store = store.clone();
            async move {
                store
                    .update(
                        CollectionName::Sales,
                        &Key::Int(500),
                        Record::new().with("quantity", 12),
                    )
                    .await
                    .unwrap()
            }
        })
    });

    group.bench_function("index_range", |b| {
        let range = KeyRange::bound("2024-01-10", "2024-01-12", false, false);
        b.to_async(&rt).iter(|| {
            let store = store.clone();
            let range = range.clone();
            async move {
                store
                    .get_all(CollectionName::Sales, Some(&range), Some("date"))
                    .await
                    .unwrap()
            }
        })
    });

    group.finish();
}

fn bench_get_all(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("get_all");

    for size in [100u64, 1000] {
        let structured = rt.block_on(async { seeded(structured().await, size).await });
        group.bench_with_input(BenchmarkId::new("structured", size), &size, |b, _| {
            b.to_async(&rt).iter(|| {
                let store = structured.clone();
                async move {
                    store
                        .get_all(CollectionName::Sales, None, None)
                        .await
                        .unwrap()
                }
            })
        });

        let flat = rt.block_on(seeded(flat(), size));
        group.bench_with_input(BenchmarkId::new("flat", size), &size, |b, _| {
            b.to_async(&rt).iter(|| {
                let store = flat.clone();
                async move {
                    store
                        .get_all(CollectionName::Sales, None, None)
                        .await
                        .unwrap()
                }
            })
        });
    }

    group.finish();
}

fn bench_export(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("backup");

    let store = rt.block_on(async { seeded(structured().await, 1000).await });
    let document = rt.block_on(store.export_all()).unwrap();

    group.bench_function("export_all", |b| {
        b.to_async(&rt).iter(|| {
            let store = store.clone();
            async move { store.export_all().await.unwrap() }
        })
    });

    group.bench_function("to_json", |b| b.iter(|| document.to_json().unwrap()));

    group.finish();
}

criterion_group!(
    benches,
    bench_derived,
    bench_structured,
    bench_get_all,
    bench_export
);
criterion_main!(benches);
