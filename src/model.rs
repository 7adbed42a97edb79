use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque session identifier as issued by the session-start path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Arc<str>);

impl SessionId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(Arc::from(id))
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

/// A session row as persisted in the session store.
///
/// `end_time` being unset means the session is OPEN. Once set the session is
/// CLOSED and its heartbeat fields no longer change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Accumulated session length in whole seconds.
    pub duration: Option<i64>,
    pub country_code: Option<String>,
}

impl Session {
    /// Creates an OPEN session with no heartbeat data yet.
    pub fn open(id: impl Into<SessionId>, start_time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            start_time,
            end_time: None,
            last_heartbeat: None,
            duration: None,
            country_code: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// A heartbeat waiting in the coalescing buffer for the next flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHeartbeat {
    pub session_id: SessionId,
    pub observed_at: DateTime<Utc>,
    pub duration_candidate: Option<i64>,
    pub country_candidate: Option<String>,
}

impl PendingHeartbeat {
    /// Builds a pending heartbeat, normalizing the optional candidates.
    ///
    /// Negative durations and blank country codes carry no information and
    /// are treated as unset. Country codes are trimmed and upper-cased.
    pub fn new(
        session_id: impl Into<SessionId>,
        observed_at: DateTime<Utc>,
        duration_candidate: Option<i64>,
        country_candidate: Option<&str>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            observed_at,
            duration_candidate: duration_candidate.filter(|d| *d >= 0),
            country_candidate: country_candidate
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_ascii_uppercase),
        }
    }
}
