use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{SessionStore, StoreError};
use crate::model::{PendingHeartbeat, Session, SessionId};

/// In-process session store with the same merge and close semantics as the
/// Postgres store.
///
/// Used by tests, benches, and dry runs without a database. Supports
/// failure injection and artificial merge latency.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionId, Session>>,
    merge_calls: AtomicU64,
    close_calls: AtomicU64,
    fail_merges: AtomicUsize,
    fail_merge_calls: Mutex<HashSet<u64>>,
    fail_scans: AtomicUsize,
    fail_close: Mutex<HashSet<SessionId>>,
    merge_delay: Mutex<Option<Duration>>,
    close_delay: Mutex<Option<Duration>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a session row.
    pub fn insert(&self, session: Session) {
        self.sessions.lock().insert(session.id.clone(), session);
    }

    /// Returns a copy of a session row.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().get(&SessionId::from(id)).cloned()
    }

    /// Number of `merge_heartbeats` calls, failed ones included.
    pub fn merge_calls(&self) -> u64 {
        self.merge_calls.load(Ordering::Relaxed)
    }

    /// Number of `close_session` calls, failed ones included.
    pub fn close_calls(&self) -> u64 {
        self.close_calls.load(Ordering::Relaxed)
    }

    /// Makes the next `n` merge calls fail without applying anything.
    pub fn fail_next_merges(&self, n: usize) {
        self.fail_merges.store(n, Ordering::SeqCst);
    }

    /// Makes the `call`-th merge call (1-based, counting every call) fail.
    pub fn fail_merge_call(&self, call: u64) {
        self.fail_merge_calls.lock().insert(call);
    }

    /// Makes the next `n` stale scans fail.
    pub fn fail_next_scans(&self, n: usize) {
        self.fail_scans.store(n, Ordering::SeqCst);
    }

    /// Makes every close of `id` fail.
    pub fn fail_close_for(&self, id: &str) {
        self.fail_close.lock().insert(SessionId::from(id));
    }

    /// Delays every merge call by `delay` before it is applied.
    pub fn set_merge_delay(&self, delay: Duration) {
        *self.merge_delay.lock() = Some(delay);
    }

    /// Delays every close call by `delay`.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock() = Some(delay);
    }

    fn take_merge_failure(&self, call: u64) -> bool {
        if self.fail_merge_calls.lock().remove(&call) {
            return true;
        }

        take_one(&self.fail_merges)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl SessionStore for MemorySessionStore {
    async fn merge_heartbeats(&self, chunk: &[PendingHeartbeat]) -> Result<u64, StoreError> {
        let call = self.merge_calls.fetch_add(1, Ordering::Relaxed) + 1;

        let delay = *self.merge_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.take_merge_failure(call) {
            return Err(StoreError::Unavailable("injected merge failure".into()));
        }

        let mut sessions = self.sessions.lock();
        let mut rows = 0u64;
        for hb in chunk {
            if let Some(session) = sessions.get_mut(&hb.session_id) {
                if session.apply_heartbeat(hb) {
                    rows += 1;
                }
            }
        }

        Ok(rows)
    }

    async fn find_stale_open_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        if take_one(&self.fail_scans) {
            return Err(StoreError::Unavailable("injected scan failure".into()));
        }

        let mut stale: Vec<Session> = self
            .sessions
            .lock()
            .values()
            .filter(|s| s.is_open() && s.last_heartbeat.map_or(true, |at| at < cutoff))
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(stale)
    }

    async fn close_session(
        &self,
        id: &SessionId,
        end_time: DateTime<Utc>,
        duration: i64,
    ) -> Result<(), StoreError> {
        self.close_calls.fetch_add(1, Ordering::Relaxed);

        let delay = *self.close_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_close.lock().contains(id) {
            return Err(StoreError::Unavailable(format!(
                "injected close failure for {id}"
            )));
        }

        if let Some(session) = self.sessions.lock().get_mut(id) {
            if session.is_open() {
                session.end_time = Some(end_time);
                session.duration = Some(duration);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone};

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    #[tokio::test]
    async fn test_merge_counts_only_open_matching_rows() {
        let store = MemorySessionStore::new();
        store.insert(Session::open("open", t(0)));
        let mut closed = Session::open("closed", t(0));
        closed.end_time = Some(t(10));
        store.insert(closed);

        let chunk = vec![
            PendingHeartbeat::new("open", t(20), Some(20), Some("de")),
            PendingHeartbeat::new("closed", t(20), Some(20), None),
            PendingHeartbeat::new("missing", t(20), None, None),
        ];

        let rows = store.merge_heartbeats(&chunk).await.expect("merge");
        assert_eq!(rows, 1);

        let open = store.get("open").expect("row");
        assert_eq!(open.last_heartbeat, Some(t(20)));
        assert_eq!(open.country_code.as_deref(), Some("DE"));
        assert_eq!(store.get("closed").expect("row").last_heartbeat, None);
    }

    #[tokio::test]
    async fn test_injected_merge_failures_are_consumed() {
        let store = MemorySessionStore::new();
        store.insert(Session::open("a", t(0)));
        store.fail_next_merges(1);

        let chunk = vec![PendingHeartbeat::new("a", t(5), None, None)];
        assert!(store.merge_heartbeats(&chunk).await.is_err());
        assert_eq!(store.merge_heartbeats(&chunk).await.expect("merge"), 1);
        assert_eq!(store.merge_calls(), 2);
    }

    #[tokio::test]
    async fn test_fail_merge_call_targets_one_call() {
        let store = MemorySessionStore::new();
        store.insert(Session::open("a", t(0)));
        store.fail_merge_call(2);

        let chunk = vec![PendingHeartbeat::new("a", t(5), None, None)];
        assert!(store.merge_heartbeats(&chunk).await.is_ok());
        assert!(store.merge_heartbeats(&chunk).await.is_err());
        assert!(store.merge_heartbeats(&chunk).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_scan_failures_are_consumed() {
        let store = MemorySessionStore::new();
        store.insert(Session::open("a", t(0)));
        store.fail_next_scans(1);

        assert!(store.find_stale_open_sessions(t(500)).await.is_err());
        assert_eq!(store.find_stale_open_sessions(t(500)).await.expect("scan").len(), 1);
    }

    #[tokio::test]
    async fn test_find_stale_includes_never_heartbeated() {
        let store = MemorySessionStore::new();
        store.insert(Session::open("silent", t(0)));

        let mut fresh = Session::open("fresh", t(0));
        fresh.last_heartbeat = Some(t(300));
        store.insert(fresh);

        let mut stale = Session::open("stale", t(0));
        stale.last_heartbeat = Some(t(45));
        store.insert(stale);

        let found = store.find_stale_open_sessions(t(220)).await.expect("scan");
        let ids: Vec<&str> = found.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["silent", "stale"]);
    }

    #[tokio::test]
    async fn test_close_leaves_closed_session_untouched() {
        let store = MemorySessionStore::new();
        let mut s = Session::open("a", t(0));
        s.end_time = Some(t(10));
        s.duration = Some(10);
        store.insert(s);

        store
            .close_session(&SessionId::from("a"), t(99), 99)
            .await
            .expect("close");

        let row = store.get("a").expect("row");
        assert_eq!(row.end_time, Some(t(10)));
        assert_eq!(row.duration, Some(10));
    }

    #[tokio::test]
    async fn test_injected_close_failure() {
        let store = MemorySessionStore::new();
        store.insert(Session::open("a", t(0)));
        store.fail_close_for("a");

        let err = store
            .close_session(&SessionId::from("a"), t(0), 0)
            .await
            .expect_err("injected failure");
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.get("a").expect("row").is_open());
    }
}
