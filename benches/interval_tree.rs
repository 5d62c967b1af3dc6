//! Benchmarks for the granted-lock interval tree and the enqueue path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use strata_delm::interval::IntervalTree;
use strata_delm::{
    DelmConfig, EnqueueFlags, EnqueueRequest, ExportId, Extent, LocalAst, LockId, LockMode,
    LockNamespace, ResourceId,
};

const PAGE: u64 = 4096;

fn populated(n: u64) -> IntervalTree {
    let mut tree = IntervalTree::new();
    for i in 0..n {
        let start = i * 2 * PAGE;
        tree.insert_unique(Extent::new(start, start + PAGE - 1).unwrap(), LockId(i));
    }
    tree
}

fn bench_insert_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("interval_insert_remove");

    for n in [100u64, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*n));
        group.bench_with_input(BenchmarkId::from_parameter(n), n, |b, &n| {
            b.iter(|| {
                let mut tree = populated(n);
                for i in 0..n {
                    let start = i * 2 * PAGE;
                    let extent = Extent::new(start, start + PAGE - 1).unwrap();
                    tree.remove(black_box(&extent), LockId(i));
                }
                tree
            })
        });
    }
    group.finish();
}

fn bench_overlap(c: &mut Criterion) {
    let mut group = c.benchmark_group("interval_overlap");

    for n in [100u64, 1_000, 10_000].iter() {
        let tree = populated(*n);
        let mid = *n * PAGE;
        group.bench_with_input(BenchmarkId::from_parameter(n), n, |b, _| {
            b.iter(|| {
                tree.iter_overlap(black_box(mid), black_box(mid + 16 * PAGE))
                    .count()
            })
        });
    }
    group.finish();
}

fn bench_neighbours(c: &mut Criterion) {
    let tree = populated(10_000);
    let mid = 10_000 * PAGE + PAGE / 2;

    c.bench_function("interval_neighbours", |b| {
        b.iter(|| {
            (
                tree.max_end_below(black_box(mid)),
                tree.min_start_above(black_box(mid)),
            )
        })
    });
}

fn bench_enqueue_cancel(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ns = LockNamespace::new(DelmConfig::default()).unwrap();
    let res = ns.resource_get(ResourceId::new(0, 1));

    // Background of disjoint writers the new request must expand around.
    for i in 0..1_000u64 {
        let start = i * 2 * PAGE;
        let req = EnqueueRequest::new(
            ExportId(i),
            LockMode::Pw,
            Extent::new(start, start + PAGE - 1).unwrap(),
            Arc::new(LocalAst),
        )
        .with_flags(EnqueueFlags::LOCK_NO_EXPAND);
        rt.block_on(ns.enqueue(&res, req)).unwrap();
    }

    c.bench_function("enqueue_cancel_1000_writers", |b| {
        b.to_async(&rt).iter(|| {
            let ns = Arc::clone(&ns);
            let res = Arc::clone(&res);
            async move {
                let req = EnqueueRequest::new(
                    ExportId(5_000),
                    LockMode::Pr,
                    Extent::new(PAGE, 2 * PAGE - 1).unwrap(),
                    Arc::new(LocalAst),
                );
                if let Some(grant) = ns.enqueue(&res, req).await.unwrap().into_grant() {
                    ns.cancel(&grant.lock).await;
                }
            }
        })
    });
}

criterion_group!(
    benches,
    bench_insert_remove,
    bench_overlap,
    bench_neighbours,
    bench_enqueue_cancel
);
criterion_main!(benches);
