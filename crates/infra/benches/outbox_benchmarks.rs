use std::sync::Arc;

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use homefix_core::{Clock, ManualClock, NotificationId};
use homefix_infra::outbox::{DispatcherConfig, LogSender, OutboxDispatcher, OutboxEnqueuer};
use homefix_infra::store::{InMemoryStore, Store, UnitOfWork};
use homefix_notify::OutboxMessage;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn seed(store: &InMemoryStore, enqueuer: &OutboxEnqueuer, n: usize) {
    let mut tx = store.begin().await.unwrap();
    for i in 0..n {
        let message = OutboxMessage::email(format!("user{i}@example.com"), "subject", "body")
            .with_notification(NotificationId::new());
        enqueuer.enqueue(&mut tx, message).await;
    }
    tx.commit().await.unwrap();
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("outbox_enqueue");

    for batch in [1usize, 20, 100] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
            let enqueuer = OutboxEnqueuer::new(clock);
            b.iter(|| {
                let store = InMemoryStore::new();
                rt.block_on(seed(&store, &enqueuer, batch));
                black_box(store.outbox().len())
            });
        });
    }
    group.finish();
}

fn bench_dispatch_cycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("outbox_dispatch_cycle");

    for backlog in [20usize, 200] {
        group.throughput(Throughput::Elements(backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, &backlog| {
            let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
            let enqueuer = OutboxEnqueuer::new(Arc::clone(&clock));
            let shutdown = CancellationToken::new();
            b.iter(|| {
                let store = InMemoryStore::new();
                rt.block_on(async {
                    seed(&store, &enqueuer, backlog).await;
                    let dispatcher = OutboxDispatcher::new(
                        store.clone(),
                        LogSender,
                        Arc::clone(&clock),
                        DispatcherConfig {
                            batch_size: backlog,
                            ..DispatcherConfig::default()
                        },
                    );
                    black_box(dispatcher.run_cycle(&shutdown).await.unwrap())
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_dispatch_cycle);
criterion_main!(benches);
