use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use sessionpulse::coalescer::merge::dedupe_latest;
use sessionpulse::config::CoalescerConfig;
use sessionpulse::{Coalescer, MemorySessionStore, PendingHeartbeat, Session};

const SESSIONS: i64 = 200;
const HEARTBEATS: i64 = 1_000;

fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

/// Five heartbeats per session, interleaved across sessions.
fn heartbeat_batch() -> Vec<PendingHeartbeat> {
    (0..HEARTBEATS)
        .map(|i| {
            PendingHeartbeat::new(
                format!("session-{}", i % SESSIONS),
                t(i),
                Some(i),
                (i % 3 == 0).then_some("de"),
            )
        })
        .collect()
}

fn bench_dedupe(c: &mut Criterion) {
    c.bench_function("dedupe_latest/1000_over_200_sessions", |b| {
        b.iter_batched(
            heartbeat_batch,
            |batch| black_box(dedupe_latest(batch).len()),
            BatchSize::SmallInput,
        )
    });
}

fn bench_apply(c: &mut Criterion) {
    let batch = heartbeat_batch();

    c.bench_function("session/apply_heartbeat", |b| {
        b.iter(|| {
            let mut session = Session::open("session-0", t(0));
            for hb in &batch {
                session.apply_heartbeat(black_box(hb));
            }
            black_box(session.duration)
        })
    });
}

fn bench_enqueue(c: &mut Criterion) {
    let cfg = CoalescerConfig {
        capacity: HEARTBEATS as usize + 1,
        flush_threshold: HEARTBEATS as usize + 1,
        flush_delay: Duration::from_secs(5),
        chunk_size: 250,
        shutdown_grace: Duration::from_secs(3),
    };

    c.bench_function("coalescer/enqueue_1000", |b| {
        b.iter_batched(
            || {
                let store = Arc::new(MemorySessionStore::new());
                (Coalescer::new(store, cfg.clone(), None), heartbeat_batch())
            },
            |(coalescer, batch)| {
                for hb in batch {
                    coalescer.enqueue_heartbeat(hb);
                }
                black_box(coalescer.buffer_size())
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_dedupe(c);
    bench_apply(c);
    bench_enqueue(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
