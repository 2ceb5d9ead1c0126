//! Dispatch benchmark
//!
//! Measures the admission path: execute → queue offer → worker run.
//! Throughput of tiny tasks is dominated by dispatch and queue overhead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use spindle_executor::{PoolConfig, WorkerPool};

fn config(workers: usize, queue_capacity: usize) -> PoolConfig {
    PoolConfig::new("bench")
        .with_core_pool_size(workers)
        .with_max_pool_size(workers)
        .with_queue_capacity(queue_capacity)
        .with_min_spare_workers(0)
}

/// Offer latency only: queues large enough that nothing is rejected
fn bench_offer(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("dispatch/offer");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let capacity = usize::try_from(iters).unwrap_or(usize::MAX).max(1);
            let pool = WorkerPool::new(config(1, capacity)).unwrap();

            let start = Instant::now();
            for _ in 0..iters {
                pool.execute(async {}).await.unwrap();
            }
            let elapsed = start.elapsed();

            pool.shutdown();
            pool.await_termination(Duration::from_secs(30)).await.unwrap();
            elapsed
        });
    });

    group.finish();
}

/// End-to-end: dispatch a batch and wait for every task to run
fn bench_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("dispatch/round_trip");
    group.sample_size(20);

    for workers in [1, 2, 4, 8] {
        let task_count = 5000u64;
        group.throughput(Throughput::Elements(task_count));
        group.bench_with_input(
            BenchmarkId::new("workers", workers),
            &workers,
            |b, &workers| {
                b.to_async(&rt).iter(|| async move {
                    let pool = WorkerPool::new(config(workers, 64)).unwrap();
                    let done = Arc::new(AtomicU64::new(0));

                    for _ in 0..task_count {
                        let done = done.clone();
                        pool.execute(async move {
                            done.fetch_add(1, Ordering::Relaxed);
                        })
                        .await
                        .unwrap();
                    }

                    pool.shutdown();
                    pool.await_termination(Duration::from_secs(30)).await.unwrap();
                    assert_eq!(done.load(Ordering::Relaxed), task_count);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_offer, bench_round_trip);
criterion_main!(benches);
