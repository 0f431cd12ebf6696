use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

use leaseq_core::{EnqueueOptions, NewJob, QueueConfig, QueueName, UniqueTag};
use leaseq_infra::{InMemoryJobStore, Queue};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Payload {
    account: u64,
    amount: i64,
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn queue() -> Queue<Payload> {
    Queue::new(
        QueueName::new("bench").unwrap(),
        InMemoryJobStore::arc(),
        QueueConfig::default(),
    )
    .unwrap()
}

fn payloads(n: usize) -> Vec<NewJob<Payload>> {
    (0..n)
        .map(|i| {
            NewJob::new(Payload {
                account: i as u64,
                amount: 100,
            })
            .with_priority((i % 10) as i32)
        })
        .collect()
}

/// Enqueue throughput for plain batches.
fn bench_enqueue_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue_throughput");

    for batch_size in [1usize, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("enqueue_many", batch_size),
            batch_size,
            |b, &size| {
                let q = queue();
                b.iter(|| {
                    black_box(rt.block_on(q.enqueue_many(payloads(size), None)).unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Lease latency against a backlog of different depths.
fn bench_lease_from_backlog(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("lease_from_backlog");

    for backlog in [100usize, 1_000, 10_000].iter() {
        group.bench_with_input(
            BenchmarkId::new("dequeue_many_10", backlog),
            backlog,
            |b, &size| {
                b.iter_batched(
                    || {
                        let q = queue();
                        rt.block_on(q.enqueue_many(payloads(size), None)).unwrap();
                        q
                    },
                    |q| black_box(rt.block_on(q.dequeue_many(10)).unwrap()),
                    criterion::BatchSize::LargeInput,
                );
            },
        );
    }

    group.finish();
}

/// Tag coalescing: repeated enqueues against a small set of tags.
fn bench_tag_coalescing(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("tag_coalescing");

    for policy in [UniqueTag::KeepOld, UniqueTag::TakeNew] {
        group.bench_function(BenchmarkId::new("enqueue", format!("{policy:?}")), |b| {
            let q = queue();
            let mut i = 0u64;
            b.iter(|| {
                i += 1;
                let options = EnqueueOptions::new()
                    .tag(format!("account-{}", i % 16))
                    .unique_tag(policy);
                black_box(
                    rt.block_on(q.enqueue(
                        Payload {
                            account: i,
                            amount: 1,
                        },
                        options,
                    ))
                    .unwrap(),
                );
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_throughput,
    bench_lease_from_backlog,
    bench_tag_coalescing
);
criterion_main!(benches);
