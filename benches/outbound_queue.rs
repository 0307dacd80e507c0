//! Outbound queue benchmark suite.
//!
//! Benchmarks queue operations at different depths:
//! - Enqueue throughput
//! - Full drain with zero pacing against the loopback transport
//! - End-to-end: queue while connecting, drain on open
//!
//! Run with: cargo bench --bench outbound_queue
//! Results saved to: target/criterion/

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use session_courier::{
    ConnectionManager, DrainFailurePolicy, LoopbackTransport, ManagerOptions, OutboundQueue,
    QueueEntry, RecipientId, TokioTimer,
};
use tokio::runtime::Runtime;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const QUEUE_DEPTHS: &[usize] = &[100, 1_000, 10_000];
const RECIPIENT: &str = "15551234567";

fn filled_queue(depth: usize) -> OutboundQueue {
    let queue = OutboundQueue::new(DrainFailurePolicy::Drop);
    let recipient = RecipientId::parse(RECIPIENT).expect("valid recipient");
    for i in 0..depth {
        queue.enqueue(QueueEntry::new(recipient.clone(), format!("message {i}"), Utc::now()));
    }
    queue
}

// ============================================================================
// Benchmark: Enqueue
// ============================================================================

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue");

    for &depth in QUEUE_DEPTHS {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| filled_queue(depth));
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Drain
// ============================================================================

fn bench_drain(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");

    let mut group = c.benchmark_group("drain");

    for &depth in QUEUE_DEPTHS {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.to_async(&rt).iter(|| async move {
                let queue = filled_queue(depth);
                let report = queue
                    .drain(|| true, |_| async { Ok(()) }, Duration::ZERO, &TokioTimer)
                    .await;
                assert_eq!(report.dispatched, depth);
            });
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Queue Then Open
// ============================================================================

fn bench_queue_then_open(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");

    let mut group = c.benchmark_group("queue_then_open");
    group.sample_size(20);

    for &depth in &QUEUE_DEPTHS[..2] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.to_async(&rt).iter(|| async move {
                let transport = LoopbackTransport::new();
                let manager = ConnectionManager::builder()
                    .transport(Arc::new(transport.clone()))
                    .options(
                        ManagerOptions::new()
                            .with_drain_start_delay(Duration::ZERO)
                            .with_drain_pacing(Duration::ZERO),
                    )
                    .build()
                    .expect("build manager");

                manager.start().await.expect("start");
                for i in 0..depth {
                    manager
                        .send(RECIPIENT, &format!("message {i}"))
                        .await
                        .expect("queue");
                }

                transport.open();
                while transport.sent().len() < depth {
                    tokio::task::yield_now().await;
                }

                manager.shutdown().await.expect("shutdown");
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_drain, bench_queue_then_open);
criterion_main!(benches);
