use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use wms_core::Payload;
use wms_infra::idempotency::{IdempotencyGuard, InMemoryIdempotencyStore, KeyGenerator};
use wms_infra::storage::{InMemoryTransaction, InMemoryUnitOfWork};
use wms_infra::transactional::{ExecutorOptions, TransactionalExecutor};
use wms_infra::IdempotencyConfig;

fn order_payload(lines: usize) -> Payload {
    let mut payload = Payload::new()
        .with("order_id", 42)
        .with("warehouse", "WH-1")
        .with("timestamp", "2026-10-17T08:00:00Z");
    for i in 0..lines {
        payload.insert(format!("line_{i}"), format!("SKU-{i}"));
    }
    payload
}

fn bench_key_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_generation");
    let keys = KeyGenerator::default();

    for lines in [1, 10, 100].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("generate", lines), lines, |b, &lines| {
            let payload = order_payload(lines);
            b.iter(|| keys.generate(black_box("create_shipment"), black_box(&payload), "api"));
        });
    }

    group.finish();
}

fn bench_guarded_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("guarded_execution");
    let rt = tokio::runtime::Runtime::new().unwrap();

    let guard = Arc::new(IdempotencyGuard::new(
        InMemoryIdempotencyStore::arc(),
        &IdempotencyConfig::default(),
    ));
    let executor = TransactionalExecutor::new(InMemoryUnitOfWork::new(), guard);

    // Same key every iteration: measures the replay path.
    group.bench_function("duplicate_replay", |b| {
        let payload = order_payload(5);
        let options = ExecutorOptions::default();
        b.iter(|| {
            rt.block_on(executor.execute_with_transaction(
                "create_shipment",
                &payload,
                |tx: &mut InMemoryTransaction, _: &Payload| {
                    Box::pin(async move {
                        tx.put("shipment:42", serde_json::json!({"status": "created"}));
                        Ok(42_i64)
                    })
                },
                None,
                &options,
            ))
            .unwrap()
        });
    });

    // Fresh key every iteration: claim, run, commit, complete.
    group.bench_function("first_execution", |b| {
        let options = ExecutorOptions::default();
        let mut n: i64 = 0;
        b.iter(|| {
            n += 1;
            let payload = Payload::new().with("order_id", n);
            rt.block_on(executor.execute_with_transaction(
                "create_shipment",
                &payload,
                |tx: &mut InMemoryTransaction, payload: &Payload| {
                    Box::pin(async move {
                        let id = payload.get("order_id").and_then(|v| v.as_i64()).unwrap_or(0);
                        tx.put(format!("shipment:{id}"), serde_json::json!({"status": "created"}));
                        Ok(id)
                    })
                },
                None,
                &options,
            ))
            .unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_key_generation, bench_guarded_execution);
criterion_main!(benches);
