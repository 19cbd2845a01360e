//! Performance benchmarks for beancache-engine

use beancache_engine::{
    AttributeSnapshot, AttributeStore, BeanData, Criteria, LocalStore, MemoryRemote,
    SyncCoordinator,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

fn coordinator() -> SyncCoordinator {
    let sync = SyncCoordinator::new(
        Arc::new(LocalStore::in_memory()),
        Arc::new(MemoryRemote::new()),
    );
    sync.boot_channel("orders").unwrap();
    sync
}

fn seeded(size: usize) -> SyncCoordinator {
    let sync = coordinator();
    for i in 0..size {
        let status = if i % 3 == 0 { "open" } else { "closed" };
        let region = ["west", "east", "north"][i % 3];
        let data = BeanData::new(
            AttributeStore::from_pairs([("status", status), ("region", region)]).unwrap(),
        );
        sync.apply_remote_update(&AttributeSnapshot::hydrated(
            "orders",
            format!("o-{}", i),
            data,
        ))
        .unwrap();
    }
    sync
}

fn bench_bean_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("bean_operations");

    group.bench_function("set_value", |b| {
        let sync = coordinator();
        let bean = sync.new_instance("orders").unwrap();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            bean.set_value(black_box("status"), i.to_string()).unwrap()
        })
    });

    group.bench_function("save_synced", |b| {
        let sync = coordinator();
        let bean = sync.new_instance("orders").unwrap();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            bean.set_value("status", i.to_string()).unwrap();
            sync.save(black_box(&bean)).unwrap()
        })
    });

    group.bench_function("save_offline", |b| {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_online(false);
        let sync = SyncCoordinator::new(Arc::new(LocalStore::in_memory()), remote);
        let bean = sync.new_instance("orders").unwrap();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            bean.set_value("status", i.to_string()).unwrap();
            sync.save(black_box(&bean)).unwrap()
        })
    });

    group.bench_function("read_by_id", |b| {
        let sync = seeded(1000);
        b.iter(|| sync.read_by_id(black_box("orders"), black_box("o-500")).unwrap())
    });

    group.finish();
}

fn bench_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("queries");

    for size in [100, 1000, 10000].iter() {
        let sync = seeded(*size);

        group.bench_with_input(BenchmarkId::new("equals_all", size), size, |b, _| {
            b.iter(|| {
                let criteria =
                    Criteria::from_pairs([("status", "open"), ("region", "west")]).unwrap();
                sync.query_by_equals_all("orders", black_box(criteria)).unwrap()
            })
        });

        group.bench_with_input(BenchmarkId::new("contains_any", size), size, |b, _| {
            b.iter(|| {
                let criteria = Criteria::from_pairs([("region", "st"), ("status", "clo")]).unwrap();
                sync.query_by_contains_at_least_one("orders", black_box(criteria))
                    .unwrap()
            })
        });
    }

    group.finish();
}

fn bench_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync");

    for size in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("drain_pending", size), size, |b, &size| {
            b.iter_with_setup(
                || {
                    let remote = Arc::new(MemoryRemote::new());
                    let sync = SyncCoordinator::new(
                        Arc::new(LocalStore::in_memory()),
                        remote.clone(),
                    );
                    remote.set_online(false);
                    let beans: Vec<_> = (0..size)
                        .map(|i| {
                            let bean = sync
                                .new_instance_with_id("orders", &format!("o-{}", i))
                                .unwrap();
                            bean.set_value("n", i.to_string()).unwrap();
                            sync.save(&bean).unwrap();
                            bean
                        })
                        .collect();
                    remote.set_online(true);
                    (sync, beans)
                },
                |(sync, _beans)| sync.sync_pending(),
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_bean_operations, bench_queries, bench_sync);
criterion_main!(benches);
