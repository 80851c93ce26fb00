use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::json;
use tokio::runtime::Runtime;

use lingoq_core::{Topic, WorkerId};
use lingoq_infra::jobs::{EnqueueOptions, MemoryBackend, QueueManager};

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn topic() -> Topic {
    Topic::new("text-translation").expect("valid topic")
}

fn bench_enqueue_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue_latency");
    group.sample_size(1000);

    group.bench_function("plain", |b| {
        let qm = QueueManager::in_memory();
        let t = topic();
        let (qm, t) = (&qm, &t);
        b.to_async(&rt).iter(move || async move {
            let id = qm
                .enqueue(t, json!({"content": "hello"}), EnqueueOptions::default())
                .await
                .expect("enqueue");
            black_box(id)
        });
    });

    group.bench_function("dedupe_hit", |b| {
        let qm = QueueManager::in_memory();
        let t = topic();
        rt.block_on(qm.enqueue(&t, json!({}), EnqueueOptions::default().with_dedupe_key("same")))
            .expect("seed");
        let (qm, t) = (&qm, &t);
        b.to_async(&rt).iter(move || async move {
            let id = qm
                .enqueue(t, json!({}), EnqueueOptions::default().with_dedupe_key("same"))
                .await
                .expect("enqueue");
            black_box(id)
        });
    });

    group.finish();
}

fn bench_claim_complete_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_complete_throughput");

    for batch_size in [1, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), batch_size, |b, &n| {
            let owner = WorkerId::new("bench/0");
            let t = topic();
            let (owner, t) = (&owner, &t);
            b.to_async(&rt).iter(move || async move {
                let qm = QueueManager::in_memory();
                for i in 0..n {
                    qm.enqueue(t, json!({"i": i}), EnqueueOptions::default())
                        .await
                        .expect("enqueue");
                }
                while let Some(claimed) = qm.claim(t, owner).await.expect("claim") {
                    qm.complete(&claimed.lease, json!({})).await.expect("complete");
                }
            });
        });
    }

    group.finish();
}

fn bench_stats_query(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("stats_query");

    for job_count in [100, 10_000].iter() {
        let backend = MemoryBackend::arc();
        let qm = QueueManager::new(backend, Default::default());
        let t = topic();
        rt.block_on(async {
            for i in 0..*job_count {
                qm.enqueue(&t, json!({"i": i}), EnqueueOptions::default())
                    .await
                    .expect("seed");
            }
        });

        let (qm, t) = (&qm, &t);
        group.bench_with_input(BenchmarkId::from_parameter(job_count), job_count, |b, _| {
            b.to_async(&rt).iter(move || async move { black_box(qm.stats(t).await.expect("stats")) });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_latency,
    bench_claim_complete_throughput,
    bench_stats_query
);
criterion_main!(benches);
