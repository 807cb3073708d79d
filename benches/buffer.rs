//! Performance benchmarks for a3s-audit
//!
//! Run with: cargo bench

use a3s_audit::buffer::{BufferConnection, DurableBuffer, MemoryBuffer};
use a3s_audit::{AuditEvent, EventType, Quote};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

const KEY: &str = "audit:pendingEvents";

fn bench_event_encoding(c: &mut Criterion) {
    let event = AuditEvent::new(
        "trader7",
        1042,
        EventType::Command,
        "<userCommand><command>BUY</command><stockSymbol>ABC</stockSymbol></userCommand>",
    )
    .unwrap();

    c.bench_function("AuditEvent encode", |b| {
        b.iter(|| event.encode());
    });

    let line = event.encode();
    c.bench_function("AuditEvent decode", |b| {
        b.iter(|| AuditEvent::decode(&line).unwrap());
    });

    c.bench_function("Quote parse", |b| {
        b.iter(|| Quote::parse("1042,ABC,123.45,trader7,1700000000000,Yh7s2kAnQ=").unwrap());
    });
}

fn bench_memory_push_pop(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let line = AuditEvent::new("trader7", 1, EventType::Command, "<c/>")
        .unwrap()
        .encode();

    c.bench_function("MemoryBuffer push+pop", |b| {
        b.to_async(&rt).iter(|| async {
            let buffer = MemoryBuffer::new();
            let mut conn = buffer.connection().await.unwrap();
            conn.push(KEY, &line).await.unwrap();
            conn.blocking_pop(KEY, Duration::from_millis(10))
                .await
                .unwrap()
        });
    });
}

fn bench_memory_drain_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let line = AuditEvent::new("trader7", 1, EventType::Command, "<c/>")
        .unwrap()
        .encode();

    let mut group = c.benchmark_group("buffer_drain");
    for count in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&rt).iter(|| async {
                let buffer = MemoryBuffer::new();
                let mut conn = buffer.connection().await.unwrap();
                for _ in 0..count {
                    conn.push(KEY, &line).await.unwrap();
                }
                while conn
                    .blocking_pop(KEY, Duration::from_millis(1))
                    .await
                    .unwrap()
                    .is_some()
                {}
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_event_encoding,
    bench_memory_push_pop,
    bench_memory_drain_throughput
);
criterion_main!(benches);
