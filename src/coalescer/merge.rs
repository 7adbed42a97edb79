//! Monotonic merge rules for heartbeat data.
//!
//! Every rule here only ever advances a field, so applying the same batch
//! twice, or two batches in either order, converges to the same row. The
//! retry-once flush policy and the concurrently running reaper both rely on
//! that property.

use std::collections::HashMap;

use crate::model::{PendingHeartbeat, Session, SessionId};

/// Maximum of two optional values where unset behaves as negative infinity.
///
/// Returns unset only when both sides are unset.
pub fn max_unset<T: Ord>(existing: Option<T>, candidate: Option<T>) -> Option<T> {
    match (existing, candidate) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Keeps an existing value forever; a candidate only fills an unset slot.
pub fn fill_once<T>(existing: Option<T>, candidate: Option<T>) -> Option<T> {
    existing.or(candidate)
}

impl Session {
    /// Merges a pending heartbeat into this row.
    ///
    /// Returns `false` without touching the row when the session is closed.
    pub fn apply_heartbeat(&mut self, hb: &PendingHeartbeat) -> bool {
        if !self.is_open() {
            return false;
        }

        self.last_heartbeat = max_unset(self.last_heartbeat, Some(hb.observed_at));
        self.duration = max_unset(self.duration, hb.duration_candidate);
        self.country_code = fill_once(self.country_code.take(), hb.country_candidate.clone());
        true
    }
}

/// Collapses a drained batch to one heartbeat per session.
///
/// The survivor is the record with the greatest `observed_at`; on a tie the
/// later arrival wins. Output keeps the order in which each session first
/// appeared in the batch.
pub fn dedupe_latest(batch: Vec<PendingHeartbeat>) -> Vec<PendingHeartbeat> {
    let mut slots: HashMap<SessionId, usize> = HashMap::with_capacity(batch.len());
    let mut out: Vec<PendingHeartbeat> = Vec::with_capacity(batch.len());

    for hb in batch {
        match slots.get(&hb.session_id) {
            Some(&idx) => {
                if hb.observed_at >= out[idx].observed_at {
                    out[idx] = hb;
                }
            }
            None => {
                slots.insert(hb.session_id.clone(), out.len());
                out.push(hb);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn hb(id: &str, at: i64, duration: Option<i64>, country: Option<&str>) -> PendingHeartbeat {
        PendingHeartbeat::new(id, t(at), duration, country)
    }

    #[test]
    fn test_max_unset() {
        assert_eq!(max_unset::<i64>(None, None), None);
        assert_eq!(max_unset(Some(3), None), Some(3));
        assert_eq!(max_unset(None, Some(7)), Some(7));
        assert_eq!(max_unset(Some(9), Some(7)), Some(9));
        assert_eq!(max_unset(Some(0), Some(7)), Some(7));
    }

    #[test]
    fn test_fill_once() {
        assert_eq!(fill_once(Some("DE"), Some("FR")), Some("DE"));
        assert_eq!(fill_once(None, Some("FR")), Some("FR"));
        assert_eq!(fill_once::<&str>(None, None), None);
        assert_eq!(fill_once(Some("DE"), None), Some("DE"));
    }

    #[test]
    fn test_apply_heartbeat_advances_fields() {
        let mut s = Session::open("a", t(0));
        assert!(s.apply_heartbeat(&hb("a", 30, Some(30), Some("se"))));
        assert_eq!(s.last_heartbeat, Some(t(30)));
        assert_eq!(s.duration, Some(30));
        assert_eq!(s.country_code.as_deref(), Some("SE"));

        // An older heartbeat never regresses and never overwrites the country.
        assert!(s.apply_heartbeat(&hb("a", 10, Some(10), Some("no"))));
        assert_eq!(s.last_heartbeat, Some(t(30)));
        assert_eq!(s.duration, Some(30));
        assert_eq!(s.country_code.as_deref(), Some("SE"));
    }

    #[test]
    fn test_apply_heartbeat_keeps_duration_unset_when_both_unset() {
        let mut s = Session::open("a", t(0));
        s.apply_heartbeat(&hb("a", 5, None, None));
        assert_eq!(s.duration, None);
        assert_eq!(s.last_heartbeat, Some(t(5)));
    }

    #[test]
    fn test_apply_heartbeat_skips_closed_session() {
        let mut s = Session::open("a", t(0));
        s.last_heartbeat = Some(t(20));
        s.duration = Some(20);
        s.end_time = Some(t(20));

        assert!(!s.apply_heartbeat(&hb("a", 90, Some(90), Some("us"))));
        assert_eq!(s.last_heartbeat, Some(t(20)));
        assert_eq!(s.duration, Some(20));
        assert_eq!(s.country_code, None);
    }

    #[test]
    fn test_apply_is_order_independent() {
        let a = hb("a", 10, Some(10), None);
        let b = hb("a", 40, Some(35), Some("fi"));

        let mut forward = Session::open("a", t(0));
        forward.apply_heartbeat(&a);
        forward.apply_heartbeat(&b);

        let mut backward = Session::open("a", t(0));
        backward.apply_heartbeat(&b);
        backward.apply_heartbeat(&a);
        backward.apply_heartbeat(&b);

        assert_eq!(forward, backward);
    }

    #[test]
    fn test_dedupe_keeps_latest_per_session() {
        let batch = vec![
            hb("a", 10, Some(1), None),
            hb("b", 5, None, None),
            hb("a", 30, Some(3), None),
            hb("a", 20, Some(2), None),
        ];

        let out = dedupe_latest(batch);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].session_id.as_str(), "a");
        assert_eq!(out[0].observed_at, t(30));
        assert_eq!(out[0].duration_candidate, Some(3));
        assert_eq!(out[1].session_id.as_str(), "b");
    }

    #[test]
    fn test_dedupe_tie_prefers_later_arrival() {
        let batch = vec![hb("a", 10, Some(1), Some("de")), hb("a", 10, Some(2), None)];

        let out = dedupe_latest(batch);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].duration_candidate, Some(2));
        assert_eq!(out[0].country_candidate, None);
    }

    #[test]
    fn test_dedupe_empty() {
        assert!(dedupe_latest(Vec::new()).is_empty());
    }
}
