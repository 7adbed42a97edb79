//! Session liveness write-coalescing engine.
//!
//! Heartbeats are buffered by a [`Coalescer`] and merged into the session
//! store in deduplicated batches; a [`Reaper`] independently closes sessions
//! that stopped heartbeating.

pub mod agent;
pub mod coalescer;
pub mod config;
pub mod health;
pub mod migrate;
pub mod model;
pub mod reaper;
pub mod store;

pub use coalescer::{Coalescer, CoalescerMetrics, FlushOutcome};
pub use model::{PendingHeartbeat, Session, SessionId};
pub use reaper::{close_policy, ReapReport, Reaper};
pub use store::{MemorySessionStore, PostgresSessionStore, SessionStore, StoreError};
