//! Benchmarks for the coordination layer: quorum tracking, merges, coordinator.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ringkv_common::{Cell, Value};
use std::collections::HashMap;

fn cell(i: usize) -> Cell {
    Cell::new(format!("row_{:05}", i).into_bytes(), b"c".to_vec())
}

// ────────────────────────── QuorumTracker benchmarks ──────────────────────────

fn bench_tracker_fan_in(c: &mut Criterion) {
    use ringkv_kv::quorum::{PendingRef, QuorumParameters, QuorumTracker};

    #[derive(PartialEq, Eq, Hash)]
    struct Ticket(usize);

    impl PendingRef for Ticket {
        fn cancel(&self) {}
    }

    let params = QuorumParameters::new(3, 2, 2).unwrap().read_request_parameters();
    let mut group = c.benchmark_group("tracker_fan_in");
    for n_units in [10, 100, 1000] {
        let units: Vec<Cell> = (0..n_units).map(cell).collect();
        group.bench_with_input(BenchmarkId::from_parameter(n_units), &units, |b, units| {
            b.iter(|| {
                let mut tracker = QuorumTracker::of(units.iter().cloned(), params);
                for replica in 0..3 {
                    tracker.register_ref(Ticket(replica), units.iter().cloned());
                }
                for replica in 0..3 {
                    if tracker.finished() {
                        break;
                    }
                    tracker.handle_success(&Ticket(replica));
                }
                black_box(tracker.cancel(true))
            });
        });
    }
    group.finish();
}

// ────────────────────────── merge benchmarks ──────────────────────────

fn bench_merge_latest_values(c: &mut Criterion) {
    use ringkv_kv::merge::merge_latest_values;

    let mut group = c.benchmark_group("merge_latest_values");
    for n_cells in [100, 1000] {
        let partials: Vec<HashMap<Cell, Value>> = (0..3)
            .map(|replica| {
                (0..n_cells)
                    .map(|i| (cell(i), Value::new(b"value".to_vec(), ((i + replica) % 7) as i64)))
                    .collect()
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(n_cells), &partials, |b, partials| {
            b.iter(|| {
                let mut acc = HashMap::new();
                for partial in partials {
                    merge_latest_values(&mut acc, partial.clone());
                }
                black_box(acc)
            });
        });
    }
    group.finish();
}

// ────────────────────────── coordinator benchmarks ──────────────────────────

fn bench_coordinator(c: &mut Criterion) {
    use ringkv_common::KeyValueService;
    use ringkv_kv::{HashRingPartitionMap, PartitionedKeyValueService, QuorumParameters, Replica};
    use ringkv_storage::MemoryKeyValueService;
    use std::sync::Arc;

    let rt = tokio::runtime::Runtime::new().unwrap();
    let replicas: Vec<Replica> = (0..3)
        .map(|i| Replica::new(format!("node_{}", i), Arc::new(MemoryKeyValueService::new())))
        .collect();
    let map = HashRingPartitionMap::evenly_spaced(1, 3, replicas).unwrap();
    let kvs = PartitionedKeyValueService::new(QuorumParameters::new(3, 2, 2).unwrap(), map);

    // Pre-populate 1000 cells
    rt.block_on(async {
        kvs.create_table("bench", 1024).await.unwrap();
        let values: HashMap<Cell, Vec<u8>> = (0..1000).map(|i| (cell(i), b"value".to_vec())).collect();
        kvs.put("bench", &values, 1).await.unwrap();
    });

    c.bench_function("coordinator_put", |b| {
        let mut i = 0usize;
        b.iter(|| {
            rt.block_on(async {
                let values = HashMap::from([(cell(i % 1000), b"value".to_vec())]);
                kvs.put("bench", &values, i as i64 + 2).await.unwrap();
            });
            i += 1;
        });
    });

    c.bench_function("coordinator_get", |b| {
        let mut i = 0usize;
        b.iter(|| {
            rt.block_on(async {
                let request = HashMap::from([(cell(i % 1000), i64::MAX)]);
                black_box(kvs.get("bench", &request).await.unwrap());
            });
            i += 1;
        });
    });
}

criterion_group!(
    benches,
    bench_tracker_fan_in,
    bench_merge_latest_values,
    bench_coordinator,
);
criterion_main!(benches);
