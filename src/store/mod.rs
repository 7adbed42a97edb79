pub mod memory;
pub mod pool;
pub mod postgres;

use chrono::{DateTime, Utc};

use crate::model::{PendingHeartbeat, Session, SessionId};

pub use memory::MemorySessionStore;
pub use pool::StorePool;
pub use postgres::PostgresSessionStore;

/// Errors returned by a session store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Narrow persistence interface consumed by the coalescer and the reaper.
///
/// Implementations must apply the monotonic merge rules from
/// [`crate::coalescer::merge`] and must never touch CLOSED sessions when
/// merging.
pub trait SessionStore: Send + Sync + 'static {
    /// Merges a chunk of deduplicated heartbeats into still-open sessions.
    ///
    /// Returns the number of session rows actually updated.
    fn merge_heartbeats(
        &self,
        chunk: &[PendingHeartbeat],
    ) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;

    /// Returns OPEN sessions whose last heartbeat is unset or older than `cutoff`.
    fn find_stale_open_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<Session>, StoreError>> + Send;

    /// Closes a single session. A session that is already CLOSED is left as is.
    fn close_session(
        &self,
        id: &SessionId,
        end_time: DateTime<Utc>,
        duration: i64,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}
