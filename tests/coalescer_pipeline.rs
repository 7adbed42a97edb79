use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sessionpulse::config::CoalescerConfig;
use sessionpulse::{Coalescer, FlushOutcome, MemorySessionStore, Session};

fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

fn coalescer(
    store: &Arc<MemorySessionStore>,
    capacity: usize,
    threshold: usize,
) -> Coalescer<MemorySessionStore> {
    let cfg = CoalescerConfig {
        capacity,
        flush_threshold: threshold,
        flush_delay: Duration::from_millis(5000),
        chunk_size: 250,
        shutdown_grace: Duration::from_millis(3000),
    };
    Coalescer::new(Arc::clone(store), cfg, None)
}

fn store_with(ids: &[&str]) -> Arc<MemorySessionStore> {
    let store = Arc::new(MemorySessionStore::new());
    for id in ids {
        store.insert(Session::open(*id, t(0)));
    }
    store
}

#[tokio::test(start_paused = true)]
async fn test_latest_heartbeat_wins_within_one_batch() {
    let store = store_with(&["s"]);
    let c = coalescer(&store, 100, 50);

    c.enqueue("s", t(20), Some(20), None);
    c.enqueue("s", t(10), Some(10), Some("br"));

    assert_eq!(
        c.flush().await,
        FlushOutcome::Persisted {
            records: 1,
            rows: 1
        }
    );
    let row = store.get("s").expect("row");
    assert_eq!(row.last_heartbeat, Some(t(20)));
    assert_eq!(row.duration, Some(20));
}

#[tokio::test(start_paused = true)]
async fn test_latest_heartbeat_wins_across_batches() {
    let store = store_with(&["s"]);
    let c = coalescer(&store, 100, 50);

    c.enqueue("s", t(20), Some(20), Some("br"));
    c.flush().await;
    c.enqueue("s", t(10), Some(10), Some("ar"));
    c.flush().await;

    let row = store.get("s").expect("row");
    assert_eq!(row.last_heartbeat, Some(t(20)));
    assert_eq!(row.duration, Some(20));
    assert_eq!(row.country_code.as_deref(), Some("BR"));
}

#[tokio::test(start_paused = true)]
async fn test_buffer_never_exceeds_capacity() {
    let store = store_with(&[]);
    let c = coalescer(&store, 5, 5);
    store.set_merge_delay(Duration::from_secs(1));

    // The fifth enqueue starts a flush that holds the guard for a second.
    for i in 0..5 {
        c.enqueue(format!("s{i}"), t(i), None, None);
    }
    tokio::time::sleep(Duration::from_millis(1)).await;

    for i in 0..20 {
        c.enqueue(format!("late{i}"), t(i), None, None);
        assert!(c.buffer_size() <= 5);
    }

    let m = c.metrics();
    assert_eq!(m.buffer_size, 5);
    assert_eq!(m.total_enqueued, 10);
    assert_eq!(m.total_dropped, 15);
}

#[tokio::test(start_paused = true)]
async fn test_closed_session_is_not_updated() {
    let store = store_with(&["open"]);
    let mut closed = Session::open("closed", t(0));
    closed.last_heartbeat = Some(t(30));
    closed.duration = Some(30);
    closed.end_time = Some(t(30));
    store.insert(closed);

    let c = coalescer(&store, 100, 50);
    c.enqueue("closed", t(90), Some(90), Some("us"));
    c.enqueue("open", t(90), Some(90), None);

    assert_eq!(
        c.flush().await,
        FlushOutcome::Persisted {
            records: 2,
            rows: 1
        }
    );
    let row = store.get("closed").expect("row");
    assert_eq!(row.last_heartbeat, Some(t(30)));
    assert_eq!(row.duration, Some(30));
    assert_eq!(row.country_code, None);
    assert_eq!(c.metrics().total_flushed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_whole_batch_failure_drops_both_sessions() {
    let store = store_with(&["a", "b"]);
    store.fail_next_merges(2);
    let c = coalescer(&store, 100, 50);

    c.enqueue("a", t(5), None, None);
    c.enqueue("b", t(6), None, None);

    assert_eq!(c.flush().await, FlushOutcome::Dropped { records: 2 });
    assert_eq!(store.merge_calls(), 2, "one attempt plus one retry");

    let m = c.metrics();
    assert_eq!(m.total_dropped, 2);
    assert_eq!(m.total_failed, 1);
    assert_eq!(m.total_flushed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_leaves_empty_buffer_and_rejects() {
    let store = store_with(&["a"]);
    let c = coalescer(&store, 100, 50);

    c.enqueue("a", t(3), Some(3), None);
    c.shutdown().await;
    assert_eq!(c.buffer_size(), 0);
    assert_eq!(store.get("a").expect("row").duration, Some(3));

    for _ in 0..3 {
        c.enqueue("a", t(4), Some(4), None);
    }
    let m = c.metrics();
    assert_eq!(m.buffer_size, 0);
    assert_eq!(m.total_dropped, 3);
    assert_eq!(store.get("a").expect("row").duration, Some(3));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_grace_exceeded_still_drains() {
    let store = store_with(&["a", "b"]);
    store.set_merge_delay(Duration::from_secs(10));
    let c = coalescer(&store, 100, 50);

    c.enqueue("a", t(1), None, None);
    let in_flight = tokio::spawn({
        let c = c.clone();
        async move { c.flush().await }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    c.enqueue("b", t(2), None, None);

    let started = tokio::time::Instant::now();
    c.shutdown().await;
    // Three seconds of grace, then ten for the final drain.
    assert!(started.elapsed() >= Duration::from_secs(13));
    assert_eq!(c.buffer_size(), 0);
    assert_eq!(store.get("b").expect("row").last_heartbeat, Some(t(2)));

    in_flight.await.expect("join");
    assert_eq!(store.get("a").expect("row").last_heartbeat, Some(t(1)));
}

#[tokio::test(start_paused = true)]
async fn test_flush_while_flushing_makes_no_store_call() {
    let store = store_with(&["a"]);
    store.set_merge_delay(Duration::from_secs(2));
    let c = coalescer(&store, 100, 50);

    c.enqueue("a", t(1), None, None);
    let in_flight = tokio::spawn({
        let c = c.clone();
        async move { c.flush().await }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(c.flush().await, FlushOutcome::InProgress);
    in_flight.await.expect("join");
    assert_eq!(store.merge_calls(), 1);
    assert_eq!(c.flush().await, FlushOutcome::Empty);
    assert_eq!(store.merge_calls(), 1);
}
