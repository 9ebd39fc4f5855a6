//! Performance benchmarks for satchel-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use satchel_engine::{BoxStore, CodecRegistry, FieldKind, FieldLayout, TypeLayout};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn test_registry() -> Arc<CodecRegistry> {
    let registry = CodecRegistry::new();
    registry
        .register(TypeLayout::new(
            "user",
            vec![
                FieldLayout::required("name", FieldKind::String),
                FieldLayout::optional("email", FieldKind::String),
                FieldLayout::optional("age", FieldKind::Int),
            ],
        ))
        .unwrap();
    Arc::new(registry)
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let registry = test_registry();
    let value = json!({"name": "Test User", "email": "test@example.com", "age": 30});
    let bytes = registry.encode("user", &value).unwrap();

    group.bench_function("encode", |b| {
        b.iter(|| registry.encode(black_box("user"), black_box(&value)))
    });

    group.bench_function("decode", |b| {
        b.iter(|| registry.decode(black_box("user"), black_box(&bytes)))
    });

    group.bench_function("fingerprint", |b| {
        let layout = TypeLayout::new(
            "user",
            vec![
                FieldLayout::required("name", FieldKind::String),
                FieldLayout::optional("email", FieldKind::String),
                FieldLayout::optional("age", FieldKind::Int),
            ],
        );
        b.iter(|| black_box(&layout).fingerprint())
    });

    group.finish();
}

fn bench_box_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("box_operations");

    // Durable put: dominated by the fsync per append
    group.bench_function("put", |b| {
        let dir = TempDir::new().unwrap();
        let store = BoxStore::new(dir.path(), test_registry()).unwrap();
        let users = store.open("users").unwrap();
        let mut id = 0u64;

        b.iter(|| {
            id += 1;
            users.put(
                black_box(&format!("user_{}", id)),
                "user",
                black_box(&json!({"name": "Test User"})),
            )
        })
    });

    // In-memory read path
    group.bench_function("get", |b| {
        let dir = TempDir::new().unwrap();
        let store = BoxStore::new(dir.path(), test_registry()).unwrap();
        let users = store.open("users").unwrap();

        // Pre-populate with 1000 records
        for i in 0..1000u64 {
            users
                .put(
                    &format!("user_{}", i),
                    "user",
                    &json!({"name": format!("User {}", i)}),
                )
                .unwrap();
        }

        b.iter(|| users.get(black_box("user_500")))
    });

    group.bench_function("keys", |b| {
        let dir = TempDir::new().unwrap();
        let store = BoxStore::new(dir.path(), test_registry()).unwrap();
        let users = store.open("users").unwrap();

        for i in 0..1000u64 {
            users
                .put(
                    &format!("user_{}", i),
                    "user",
                    &json!({"name": format!("User {}", i)}),
                )
                .unwrap();
        }

        b.iter(|| users.keys())
    });

    group.finish();
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");
    group.sample_size(20);

    for size in [100, 500, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("open", size), size, |b, &size| {
            let dir = TempDir::new().unwrap();
            {
                let store = BoxStore::new(dir.path(), test_registry()).unwrap();
                let users = store.open("users").unwrap();
                for i in 0..size {
                    users
                        .put(
                            &format!("user_{}", i),
                            "user",
                            &json!({"name": format!("User {}", i), "email": format!("user{}@test.com", i)}),
                        )
                        .unwrap();
                }
            }

            b.iter(|| {
                let store = BoxStore::new(dir.path(), test_registry()).unwrap();
                store.open(black_box("users"))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_codec, bench_box_operations, bench_replay);
criterion_main!(benches);
